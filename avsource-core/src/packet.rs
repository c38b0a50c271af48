//! Raw packets and the mixed-stream packet buffer.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::backend::BackendPacket;
use crate::timestamp;

/// Compressed data of one stream, timestamp in backend microseconds.
/// Negative timestamps mark packets the container could not order.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub stream_index: usize,
    pub timestamp: i64,
    pub data: Bytes,
}

impl RawPacket {
    pub fn new(stream_index: usize, timestamp: i64, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            timestamp,
            data: data.into(),
        }
    }

    /// Timestamp in seconds
    pub fn seconds(&self) -> f64 {
        timestamp::from_backend(self.timestamp)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<BackendPacket> for RawPacket {
    fn from(packet: BackendPacket) -> Self {
        Self {
            stream_index: packet.stream_index,
            timestamp: packet.timestamp,
            data: packet.data,
        }
    }
}

/// Packets read ahead of their stream's consumer, in read order.
///
/// Bounded: when full, the oldest packet is evicted and handed back to the
/// caller so it can be logged.
#[derive(Debug)]
pub struct PacketBuffer {
    packets: VecDeque<RawPacket>,
    capacity: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a packet, returning the evicted one if the buffer was full
    pub fn push(&mut self, packet: RawPacket) -> Option<RawPacket> {
        let evicted = if self.packets.len() >= self.capacity {
            self.packets.pop_front()
        } else {
            None
        };
        self.packets.push_back(packet);
        evicted
    }

    /// Remove and return the oldest packet of `stream_index`
    pub fn take_first(&mut self, stream_index: usize) -> Option<RawPacket> {
        let pos = self
            .packets
            .iter()
            .position(|p| p.stream_index == stream_index)?;
        self.packets.remove(pos)
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
