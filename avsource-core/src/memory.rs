//! # In-Memory Backend
//!
//! A scripted [`Backend`] with no native library behind it. Clips are built
//! in code, registered under a locator, and played back packet by packet.
//! Used by the test suites and by the headless player.
//!
//! Codecs are trivial:
//! - audio is PCM passthrough, optionally in fixed-size frames
//! - video tiles the packet payload over the RGB24 output
//! - any payload starting with [`CORRUPT_MARKER`] fails to decode
//!
//! A video stream can be given a [`DecodeGate`] that holds every decode call
//! until the test opens it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::backend::{
    AudioDecodeResult, AudioStreamInfo, Backend, BackendError, BackendPacket, ContainerHandle,
    ContainerInfo, LogLevel, SampleFormat, StreamDecoder, StreamInfo, VideoStreamInfo,
};
use crate::timestamp;

/// Payload prefix that makes both memory codecs report a decode error
pub const CORRUPT_MARKER: &[u8] = b"\xffCORRUPT";

/// Scratch size reported to the audio path
pub const DEFAULT_AUDIO_BUFFER_SIZE: usize = 192_000;

// ============================================================================
// Clips
// ============================================================================

#[derive(Debug, Clone)]
pub struct MemoryStream {
    info: StreamInfo,
    fail_open: bool,
    audio_frame_bytes: Option<usize>,
    decode_gate: Option<Arc<DecodeGate>>,
}

impl MemoryStream {
    pub fn video(width: u32, height: u32) -> Self {
        Self::new(StreamInfo::Video(VideoStreamInfo {
            width,
            height,
            sample_aspect_num: 0,
            sample_aspect_den: 0,
        }))
    }

    pub fn audio(sample_rate: u32, channels: u32, sample_bits: u32) -> Self {
        let sample_format = match sample_bits {
            8 => SampleFormat::U8,
            16 => SampleFormat::S16,
            24 => SampleFormat::S24,
            32 => SampleFormat::S32,
            _ => SampleFormat::Float,
        };
        Self::new(StreamInfo::Audio(AudioStreamInfo {
            sample_format,
            sample_rate,
            sample_bits,
            channels,
        }))
    }

    /// A stream nobody decodes (subtitles, data)
    pub fn other() -> Self {
        Self::new(StreamInfo::Unknown)
    }

    fn new(info: StreamInfo) -> Self {
        Self {
            info,
            fail_open: false,
            audio_frame_bytes: None,
            decode_gate: None,
        }
    }

    /// Make `open_stream` fail for this stream
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_sample_aspect(mut self, num: i32, den: i32) -> Self {
        if let StreamInfo::Video(video) = &mut self.info {
            video.sample_aspect_num = num;
            video.sample_aspect_den = den;
        }
        self
    }

    /// Emit at most `bytes` of PCM per decode call
    pub fn with_audio_frame_bytes(mut self, bytes: usize) -> Self {
        self.audio_frame_bytes = Some(bytes);
        self
    }

    /// Hold every video decode call at `gate`
    pub fn with_decode_gate(mut self, gate: Arc<DecodeGate>) -> Self {
        self.decode_gate = Some(gate);
        self
    }
}

/// A scripted container: streams, metadata and packets in file order
#[derive(Debug, Clone, Default)]
pub struct MemoryClip {
    info: ContainerInfo,
    streams: Vec<MemoryStream>,
    packets: Vec<BackendPacket>,
    fail_seek: bool,
}

impl MemoryClip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, stream: MemoryStream) -> Self {
        self.streams.push(stream);
        self.info.stream_count = self.streams.len();
        self
    }

    /// Append a packet, timestamp in microseconds
    pub fn with_packet(mut self, stream_index: usize, timestamp: i64, data: impl Into<Bytes>) -> Self {
        self.packets.push(BackendPacket {
            stream_index,
            timestamp,
            data: data.into(),
        });
        self
    }

    /// Microseconds
    pub fn with_duration(mut self, duration: i64) -> Self {
        self.info.duration = duration;
        self
    }

    /// Microseconds
    pub fn with_start_time(mut self, start_time: i64) -> Self {
        self.info.start_time = start_time;
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.info.title = title.to_string();
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.info.author = author.to_string();
        self
    }

    pub fn with_album(mut self, album: &str, track: Option<u32>, year: Option<i32>) -> Self {
        self.info.album = album.to_string();
        self.info.track = track;
        self.info.year = year;
        self
    }

    /// Make every seek on this clip fail
    pub fn failing_seek(mut self) -> Self {
        self.fail_seek = true;
        self
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }
}

// ============================================================================
// Synthetic clips
// ============================================================================

/// Generates an interleaved video + audio clip: stream 0 is video, stream 1
/// is audio.
#[derive(Debug, Clone)]
pub struct SyntheticClip {
    /// Seconds
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub sample_bits: u32,
    /// Seconds of audio per packet
    pub audio_packet_duration: f64,
}

impl Default for SyntheticClip {
    fn default() -> Self {
        Self {
            duration: 5.0,
            fps: 25.0,
            width: 64,
            height: 36,
            sample_rate: 22_050,
            channels: 2,
            sample_bits: 16,
            audio_packet_duration: 0.05,
        }
    }
}

impl SyntheticClip {
    pub fn build(&self) -> MemoryClip {
        let mut packets = Vec::new();

        if self.fps > 0.0 {
            let frames = (self.duration * self.fps).floor() as u64;
            for i in 0..frames {
                let n = i as usize;
                // one RGB triple, tiled over the picture by the decoder
                let color = vec![(n * 7 % 256) as u8, (n * 13 % 256) as u8, (n * 17 % 256) as u8];
                packets.push(BackendPacket {
                    stream_index: 0,
                    timestamp: timestamp::to_backend(i as f64 / self.fps),
                    data: Bytes::from(color),
                });
            }
        }

        if self.audio_packet_duration > 0.0 {
            let bytes_per_second = (self.sample_bits / 8 * self.channels * self.sample_rate) as f64;
            let packet_bytes = (self.audio_packet_duration * bytes_per_second).round() as usize;
            let count = (self.duration / self.audio_packet_duration).ceil() as u64;
            for i in 0..count {
                let pcm: Vec<u8> = (0..packet_bytes).map(|b| ((b + i as usize * 3) % 256) as u8).collect();
                packets.push(BackendPacket {
                    stream_index: 1,
                    timestamp: timestamp::to_backend(i as f64 * self.audio_packet_duration),
                    data: Bytes::from(pcm),
                });
            }
        }

        // file order: by timestamp, video first on ties
        packets.sort_by_key(|p| p.timestamp);

        let mut clip = MemoryClip::new()
            .with_duration(timestamp::to_backend(self.duration))
            .with_title("Synthetic test pattern")
            .with_stream(MemoryStream::video(self.width, self.height))
            .with_stream(MemoryStream::audio(self.sample_rate, self.channels, self.sample_bits));
        clip.packets = packets;
        clip
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct MemoryBackend {
    clips: Mutex<HashMap<String, MemoryClip>>,
    init_failure: Option<String>,
    log_level: Mutex<Option<LogLevel>>,
    audio_buffer_size: usize,
    open_containers: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            clips: Mutex::new(HashMap::new()),
            init_failure: None,
            log_level: Mutex::new(None),
            audio_buffer_size: DEFAULT_AUDIO_BUFFER_SIZE,
            open_containers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make `init` fail with `reason`
    pub fn with_init_failure(mut self, reason: &str) -> Self {
        self.init_failure = Some(reason.to_string());
        self
    }

    pub fn with_audio_buffer_size(mut self, size: usize) -> Self {
        self.audio_buffer_size = size;
        self
    }

    /// Register `clip` under `locator`, replacing any previous one
    pub fn insert(&self, locator: &str, clip: MemoryClip) {
        self.clips.lock().insert(locator.to_string(), clip);
    }

    /// Level applied by the last `set_log_level`
    pub fn current_log_level(&self) -> Option<LogLevel> {
        *self.log_level.lock()
    }

    /// Containers opened and not yet dropped
    pub fn open_containers(&self) -> usize {
        self.open_containers.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn version(&self) -> u32 {
        1
    }

    fn init(&self) -> Result<(), BackendError> {
        match &self.init_failure {
            Some(reason) => Err(BackendError::Init(reason.clone())),
            None => Ok(()),
        }
    }

    fn set_log_level(&self, level: LogLevel) -> Result<(), BackendError> {
        *self.log_level.lock() = Some(level);
        Ok(())
    }

    fn audio_buffer_size(&self) -> usize {
        self.audio_buffer_size
    }

    fn has_feature(&self, feature: &str) -> bool {
        matches!(feature, "audio" | "video" | "seek")
    }

    fn open_container(&self, locator: &str) -> Result<Box<dyn ContainerHandle>, BackendError> {
        let clip = self
            .clips
            .lock()
            .get(locator)
            .cloned()
            .ok_or_else(|| BackendError::OpenContainer {
                locator: locator.to_string(),
                reason: "no such clip".into(),
            })?;

        self.open_containers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryContainer {
            clip,
            position: 0,
            open_containers: Arc::clone(&self.open_containers),
        }))
    }
}

struct MemoryContainer {
    clip: MemoryClip,
    position: usize,
    open_containers: Arc<AtomicUsize>,
}

impl Drop for MemoryContainer {
    fn drop(&mut self) {
        self.open_containers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContainerHandle for MemoryContainer {
    fn info(&self) -> ContainerInfo {
        self.clip.info.clone()
    }

    fn stream_info(&self, index: usize) -> Result<StreamInfo, BackendError> {
        self.clip
            .streams
            .get(index)
            .map(|s| s.info.clone())
            .ok_or_else(|| BackendError::OpenStream {
                index,
                reason: "no such stream".into(),
            })
    }

    fn open_stream(&mut self, index: usize) -> Result<Box<dyn StreamDecoder>, BackendError> {
        let stream = self.clip.streams.get(index).ok_or_else(|| BackendError::OpenStream {
            index,
            reason: "no such stream".into(),
        })?;

        if stream.fail_open {
            return Err(BackendError::OpenStream {
                index,
                reason: "codec not available".into(),
            });
        }

        match stream.info {
            StreamInfo::Video(_) => match &stream.decode_gate {
                Some(gate) => Ok(Box::new(GatedRgbDecoder::new(Arc::clone(gate)))),
                None => Ok(Box::new(TiledRgbDecoder)),
            },
            StreamInfo::Audio(_) => Ok(Box::new(PcmDecoder {
                frame_bytes: stream.audio_frame_bytes,
            })),
            StreamInfo::Unknown => Err(BackendError::OpenStream {
                index,
                reason: "no decoder for stream type".into(),
            }),
        }
    }

    fn read_packet(&mut self) -> Result<Option<BackendPacket>, BackendError> {
        let packet = self.clip.packets.get(self.position).cloned();
        if packet.is_some() {
            self.position += 1;
        }
        Ok(packet)
    }

    /// Lands on the first packet, in file order, at or after the target
    fn seek(&mut self, timestamp_us: i64) -> Result<(), BackendError> {
        if self.clip.fail_seek || timestamp_us < 0 {
            return Err(BackendError::Seek {
                timestamp_us,
                reason: "position not seekable".into(),
            });
        }

        self.position = self
            .clip
            .packets
            .iter()
            .position(|p| p.timestamp >= timestamp_us)
            .unwrap_or(self.clip.packets.len());
        Ok(())
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Copies input to output unchanged
struct PcmDecoder {
    frame_bytes: Option<usize>,
}

impl StreamDecoder for PcmDecoder {
    fn decode_audio(&mut self, input: &[u8], output: &mut [u8]) -> Result<AudioDecodeResult, BackendError> {
        if input.starts_with(CORRUPT_MARKER) {
            return Err(BackendError::Decode("corrupt audio frame".into()));
        }

        let n = input
            .len()
            .min(output.len())
            .min(self.frame_bytes.unwrap_or(usize::MAX));
        output[..n].copy_from_slice(&input[..n]);
        Ok(AudioDecodeResult {
            consumed: n,
            produced: n,
        })
    }
}

/// Repeats the packet payload across the whole picture
#[derive(Debug, Clone, Copy, Default)]
pub struct TiledRgbDecoder;

impl StreamDecoder for TiledRgbDecoder {
    fn decode_video(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), BackendError> {
        if input.is_empty() {
            return Err(BackendError::Decode("empty video packet".into()));
        }
        if input.starts_with(CORRUPT_MARKER) {
            return Err(BackendError::Decode("corrupt video frame".into()));
        }

        for (out, byte) in output.iter_mut().zip(input.iter().cycle()) {
            *out = *byte;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// Blocks decode calls until opened. Once open it stays open.
#[derive(Debug, Default)]
pub struct DecodeGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl DecodeGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let every waiting and future decode through
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.open = true;
        self.changed.notify_all();
    }

    /// Decode calls that have reached the gate so far
    pub fn entered(&self) -> usize {
        self.state.lock().entered
    }

    /// Wait until `count` decode calls have reached the gate
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.entered < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.entered >= count;
            }
        }
        true
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.entered += 1;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
    }
}

/// [`TiledRgbDecoder`] that waits at a [`DecodeGate`] before each picture
pub struct GatedRgbDecoder {
    gate: Arc<DecodeGate>,
}

impl GatedRgbDecoder {
    pub fn new(gate: Arc<DecodeGate>) -> Self {
        Self { gate }
    }
}

impl StreamDecoder for GatedRgbDecoder {
    fn decode_video(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), BackendError> {
        self.gate.pass();
        TiledRgbDecoder.decode_video(input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_lands_on_first_packet_at_target() {
        let backend = MemoryBackend::new();
        backend.insert(
            "clip",
            MemoryClip::new()
                .with_stream(MemoryStream::audio(8_000, 1, 8))
                .with_packet(0, 0, vec![0])
                .with_packet(0, 1_000_000, vec![1])
                .with_packet(0, 2_000_000, vec![2]),
        );
        let mut container = backend.open_container("clip").unwrap();

        container.seek(1_500_000).unwrap();
        assert_eq!(container.read_packet().unwrap().unwrap().timestamp, 2_000_000);

        container.seek(9_000_000).unwrap();
        assert!(container.read_packet().unwrap().is_none());

        assert!(matches!(container.seek(-1), Err(BackendError::Seek { .. })));
    }

    #[test]
    fn test_pcm_frames() {
        let mut decoder = PcmDecoder { frame_bytes: Some(3) };
        let mut out = [0u8; 8];

        let result = decoder.decode_audio(&[1, 2, 3, 4, 5], &mut out).unwrap();
        assert_eq!(result, AudioDecodeResult { consumed: 3, produced: 3 });
        assert_eq!(&out[..3], &[1, 2, 3]);

        assert!(decoder.decode_audio(CORRUPT_MARKER, &mut out).is_err());
    }

    #[test]
    fn test_open_stream_by_kind() {
        let backend = MemoryBackend::new();
        backend.insert(
            "clip",
            MemoryClip::new()
                .with_stream(MemoryStream::video(2, 2))
                .with_stream(MemoryStream::other())
                .with_stream(MemoryStream::audio(8_000, 1, 8).failing_open()),
        );
        let mut container = backend.open_container("clip").unwrap();

        assert!(container.open_stream(0).is_ok());
        assert!(container.open_stream(1).is_err());
        assert!(container.open_stream(2).is_err());
        assert!(container.open_stream(3).is_err());
        assert_eq!(container.info().stream_count, 3);
    }

    #[test]
    fn test_synthetic_clip_layout() {
        let clip = SyntheticClip {
            duration: 1.0,
            fps: 10.0,
            sample_rate: 8_000,
            channels: 1,
            sample_bits: 8,
            audio_packet_duration: 0.25,
            ..Default::default()
        }
        .build();

        assert_eq!(clip.info.stream_count, 2);
        assert_eq!(clip.info.duration, 1_000_000);
        assert_eq!(clip.packet_count(), 10 + 4);
        assert!(clip.packets.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let audio: Vec<&BackendPacket> = clip.packets.iter().filter(|p| p.stream_index == 1).collect();
        assert!(audio.iter().all(|p| p.data.len() == 2_000));
    }

    #[test]
    fn test_tiled_rgb_fill() {
        let mut out = [0u8; 7];
        TiledRgbDecoder.decode_video(&[1, 2, 3], &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 1, 2, 3, 1]);
        assert!(TiledRgbDecoder.decode_video(&[], &mut out).is_err());
    }

    #[test]
    fn test_gated_decoder_waits_for_open() {
        let gate = DecodeGate::new();
        let decoder = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let mut out = [0u8; 3];
                let result = GatedRgbDecoder::new(gate).decode_video(&[4, 5, 6], &mut out);
                result.map(|()| out)
            })
        };

        assert!(gate.wait_entered(1, Duration::from_secs(5)));
        assert!(!decoder.is_finished());
        gate.open();
        assert_eq!(decoder.join().unwrap().unwrap(), [4, 5, 6]);
        assert_eq!(gate.entered(), 1);
    }

    #[test]
    fn test_reports_features() {
        let backend = MemoryBackend::new();
        assert!(backend.has_feature("seek"));
        assert!(backend.has_feature("video"));
        assert!(!backend.has_feature("network"));
    }

    #[test]
    fn test_open_containers_counted() {
        let backend = MemoryBackend::new();
        backend.insert("clip", MemoryClip::new());

        let first = backend.open_container("clip").unwrap();
        let second = backend.open_container("clip").unwrap();
        assert_eq!(backend.open_containers(), 2);

        drop(first);
        drop(second);
        assert_eq!(backend.open_containers(), 0);
    }
}
