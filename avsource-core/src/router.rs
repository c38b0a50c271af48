//! # Packet Router
//!
//! Pulls packets from the container in file order and sends each one where
//! it belongs:
//!
//! - the stream being asked for: returned to the caller
//! - the active video stream: handed to the decode worker (its timestamp is
//!   remembered for sync events when there is also audio)
//! - the active audio stream: held in the packet buffer until asked for
//! - anything else: discarded
//!
//! Video packets with a negative timestamp cannot be placed in presentation
//! order and are dropped here; nothing downstream ever sees them.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::BackendError;
use crate::container::Container;
use crate::packet::{PacketBuffer, RawPacket};
use crate::stats::Counters;
use crate::stream::StreamKind;
use crate::worker::VideoFeed;

pub struct PacketRouter {
    container: Container,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    buffer: PacketBuffer,
    video_feed: Option<VideoFeed>,
    /// Upcoming video timestamps not yet claimed by an audio chunk
    video_timestamps: VecDeque<f64>,
    track_video_timestamps: bool,
    /// Newest video timestamp routed since open or the last seek
    last_video_timestamp: Option<f64>,
    counters: Arc<Counters>,
}

impl PacketRouter {
    pub fn new(
        container: Container,
        video_index: Option<usize>,
        audio_index: Option<usize>,
        buffer_capacity: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            container,
            video_index,
            audio_index,
            buffer: PacketBuffer::new(buffer_capacity),
            video_feed: None,
            video_timestamps: VecDeque::new(),
            // nobody drains the list without audio chunks to attach events to
            track_video_timestamps: video_index.is_some() && audio_index.is_some(),
            last_video_timestamp: None,
            counters,
        }
    }

    /// Route video packets to a decode worker instead of the packet buffer
    pub fn attach_video_feed(&mut self, feed: VideoFeed) {
        self.video_feed = Some(feed);
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn buffered_packets(&self) -> usize {
        self.buffer.len()
    }

    pub fn known_video_timestamps(&self) -> usize {
        self.video_timestamps.len()
    }

    fn index_of(&self, kind: StreamKind) -> Option<usize> {
        match kind {
            StreamKind::Video => self.video_index,
            StreamKind::Audio => self.audio_index,
        }
    }

    /// Next packet of `kind`, or `None` once the container is out of input.
    pub fn read_next_for(&mut self, kind: StreamKind) -> Option<RawPacket> {
        let index = self.index_of(kind)?;

        if let Some(packet) = self.buffer.take_first(index) {
            return Some(packet);
        }

        loop {
            let packet = self.read_raw()?;
            if self.is_unordered_video(&packet) {
                continue;
            }
            if packet.stream_index == index {
                return Some(packet);
            }
            self.stash(packet);
        }
    }

    /// Read ahead until a video packet at or past `until` (seconds) has been
    /// routed, input runs out, or the packet buffer is full. Everything read
    /// is kept for its stream; read-ahead never evicts a buffered packet.
    pub fn prebuffer_video_timestamps(&mut self, until: f64) {
        self.read_ahead(until, false);
    }

    /// Same as `prebuffer_video_timestamps`, but also stops while the decode
    /// worker's input is full, so the caller never waits on the worker.
    pub fn feed_video_until(&mut self, until: f64) {
        self.read_ahead(until, true);
    }

    fn read_ahead(&mut self, until: f64, stop_at_full_feed: bool) {
        if self.video_index.is_none() {
            return;
        }

        while self.last_video_timestamp.map_or(true, |ts| ts < until) {
            if self.buffer.is_full() {
                tracing::trace!("Packet buffer full, read-ahead paused before {:.3}s", until);
                break;
            }
            // we are the only producer, so room seen here is still there
            // when the packet is sent
            if stop_at_full_feed && self.video_feed.as_ref().is_some_and(|feed| !feed.has_room()) {
                break;
            }

            let Some(packet) = self.read_raw() else {
                break;
            };
            if self.is_unordered_video(&packet) {
                continue;
            }
            self.stash(packet);
        }
    }

    /// Remove and return every known video timestamp strictly before `end`,
    /// oldest first.
    pub fn drain_video_timestamps_before(&mut self, end: f64) -> Vec<f64> {
        let mut drained = Vec::new();
        while let Some(&ts) = self.video_timestamps.front() {
            if ts >= end {
                break;
            }
            drained.push(ts);
            self.video_timestamps.pop_front();
        }
        drained
    }

    /// Reposition the container and forget everything read so far. State is
    /// cleared even when the backend reports a failed seek.
    pub fn seek(&mut self, target: f64) -> Result<(), BackendError> {
        let result = self.container.seek(target);
        self.buffer.clear();
        self.video_timestamps.clear();
        self.last_video_timestamp = None;
        result
    }

    fn read_raw(&mut self) -> Option<RawPacket> {
        match self.container.read_packet() {
            Ok(Some(packet)) => {
                Counters::bump(&self.counters.packets_read);
                tracing::trace!(
                    "Read packet: stream {}, {} bytes at {}us",
                    packet.stream_index,
                    packet.len(),
                    packet.timestamp
                );
                Some(packet)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Read error, treating as end of input: {}", e);
                None
            }
        }
    }

    fn is_unordered_video(&self, packet: &RawPacket) -> bool {
        if Some(packet.stream_index) == self.video_index && packet.timestamp < 0 {
            Counters::bump(&self.counters.negative_timestamps);
            tracing::trace!("Dropping video packet with timestamp {}", packet.timestamp);
            return true;
        }
        false
    }

    /// Keep a packet for its stream, or discard it
    fn stash(&mut self, packet: RawPacket) {
        if Some(packet.stream_index) == self.video_index {
            self.dispatch_video(packet);
        } else if Some(packet.stream_index) == self.audio_index {
            self.buffer_packet(packet);
        } else {
            Counters::bump(&self.counters.packets_discarded);
        }
    }

    fn dispatch_video(&mut self, packet: RawPacket) {
        let ts = packet.seconds();
        self.last_video_timestamp = Some(ts);
        if self.track_video_timestamps {
            self.video_timestamps.push_back(ts);
        }

        match &self.video_feed {
            Some(feed) => feed.send(packet),
            None => self.buffer_packet(packet),
        }
    }

    fn buffer_packet(&mut self, packet: RawPacket) {
        if let Some(evicted) = self.buffer.push(packet) {
            Counters::bump(&self.counters.buffer_overflows);
            tracing::warn!(
                "Packet buffer full ({}), dropped stream {} packet at {:.3}s",
                self.buffer.capacity(),
                evicted.stream_index,
                evicted.seconds()
            );
        }
    }
}
