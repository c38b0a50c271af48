//! # Audio Decode Path
//!
//! Audio is decoded synchronously on the caller's thread and is the master
//! clock. Each chunk carries the video timestamps that fall inside its span,
//! so the consumer knows when to ask for the next picture.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::backend::StreamDecoder;
use crate::router::PacketRouter;
use crate::stats::Counters;
use crate::stream::{ActiveStream, AudioFormat, StreamKind};

// ============================================================================
// Chunks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    /// A video frame becomes due
    VideoFrame,
}

/// A marker inside an audio chunk, timestamp in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncEvent {
    pub timestamp: f64,
    pub kind: SyncEventKind,
}

/// Decoded PCM in the stream's native layout
#[derive(Debug, Clone)]
pub struct DecodedAudioChunk {
    pub data: Bytes,
    /// Start, seconds
    pub timestamp: f64,
    /// Seconds
    pub duration: f64,
    /// Every video timestamp before `timestamp + duration` not announced by
    /// an earlier chunk, ascending. Frames found late can fall before
    /// `timestamp`.
    pub events: Vec<SyncEvent>,
}

impl DecodedAudioChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn end(&self) -> f64 {
        self.timestamp + self.duration
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Running audio position in seconds
#[derive(Debug, Clone)]
struct AudioClock {
    seconds: f64,
    /// Take the next packet timestamp as-is (after open or seek)
    reseed: bool,
}

impl AudioClock {
    fn new() -> Self {
        Self {
            seconds: 0.0,
            reseed: true,
        }
    }

    /// A new compressed packet starts at `timestamp`
    fn observe_packet(&mut self, timestamp: f64) {
        let timestamp = timestamp.max(0.0);
        if self.reseed {
            self.seconds = timestamp;
            self.reseed = false;
        } else if timestamp > self.seconds {
            self.seconds = timestamp;
        }
    }

    /// Move forward by `duration`, returning where the chunk starts
    fn advance(&mut self, duration: f64) -> f64 {
        let start = self.seconds;
        self.seconds += duration;
        start
    }

    fn reset(&mut self, target: f64) {
        self.seconds = target.max(0.0);
        self.reseed = true;
    }
}

// ============================================================================
// Decode path
// ============================================================================

struct HeldPacket {
    data: Bytes,
    offset: usize,
}

impl HeldPacket {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

pub struct AudioDecodePath {
    index: usize,
    format: AudioFormat,
    decoder: Box<dyn StreamDecoder>,
    scratch: Vec<u8>,
    held: Option<HeldPacket>,
    clock: AudioClock,
    counters: Arc<Counters>,
}

impl AudioDecodePath {
    /// `scratch_size` is the most one decode call may write, as reported by
    /// the backend.
    pub fn new(stream: ActiveStream<AudioFormat>, scratch_size: usize, counters: Arc<Counters>) -> Self {
        Self {
            index: stream.index,
            format: stream.format,
            decoder: stream.decoder,
            scratch: vec![0u8; scratch_size.max(1)],
            held: None,
            clock: AudioClock::new(),
            counters,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Current audio clock in seconds
    pub fn clock(&self) -> f64 {
        self.clock.seconds
    }

    /// Decode the next chunk, pulling packets through `router` as needed.
    /// `None` once the container has no more audio.
    pub fn next_chunk(&mut self, router: &mut PacketRouter) -> Option<DecodedAudioChunk> {
        loop {
            if let Some(produced) = self.decode_held() {
                return Some(self.emit(produced, router));
            }

            let packet = router.read_next_for(StreamKind::Audio)?;
            self.clock.observe_packet(packet.seconds());
            self.held = Some(HeldPacket {
                data: packet.data,
                offset: 0,
            });
        }
    }

    /// Drop the held packet and restart the clock at `target`
    pub fn reset(&mut self, target: f64) {
        self.held = None;
        self.clock.reset(target);
    }

    /// Run the decoder over the held packet until it yields output. Returns
    /// the number of bytes written to `scratch`, or `None` once the packet
    /// is used up or broken.
    fn decode_held(&mut self) -> Option<usize> {
        let held = self.held.as_mut()?;

        while !held.remaining().is_empty() {
            let remaining = held.remaining().len();
            match self.decoder.decode_audio(held.remaining(), &mut self.scratch) {
                Ok(result) if result.consumed == 0 && result.produced == 0 => {
                    Counters::bump(&self.counters.audio_decode_errors);
                    tracing::warn!("Audio decoder made no progress, dropping {} bytes", remaining);
                    break;
                }
                Ok(result) => {
                    held.offset += result.consumed.min(remaining);
                    if result.produced > 0 {
                        return Some(result.produced.min(self.scratch.len()));
                    }
                }
                Err(e) => {
                    Counters::bump(&self.counters.audio_decode_errors);
                    tracing::warn!("Audio decode failed, dropping {} bytes: {}", remaining, e);
                    break;
                }
            }
        }

        self.held = None;
        None
    }

    fn emit(&mut self, produced: usize, router: &mut PacketRouter) -> DecodedAudioChunk {
        let data = Bytes::copy_from_slice(&self.scratch[..produced]);
        let duration = match self.format.bytes_per_second() {
            0 => 0.0,
            bps => produced as f64 / bps as f64,
        };
        let timestamp = self.clock.advance(duration);

        router.prebuffer_video_timestamps(self.clock.seconds);
        let events: Vec<SyncEvent> = router
            .drain_video_timestamps_before(timestamp + duration)
            .into_iter()
            .map(|ts| SyncEvent {
                timestamp: ts,
                kind: SyncEventKind::VideoFrame,
            })
            .collect();

        Counters::bump(&self.counters.audio_chunks);
        tracing::trace!(
            "Audio chunk: {} bytes at {:.3}s for {:.3}s, {} sync events",
            produced,
            timestamp,
            duration,
            events.len()
        );

        DecodedAudioChunk {
            data,
            timestamp,
            duration,
            events,
        }
    }
}
