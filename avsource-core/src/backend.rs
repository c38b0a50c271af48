//! # Decoder Backend
//!
//! The native side of a media source: container parsing, packet reads and
//! the actual codec arithmetic. Everything above this module only sees these
//! traits.
//!
//! ```text
//! Backend ──open_container──► ContainerHandle ──open_stream──► StreamDecoder
//!                                   │
//!                              read_packet / seek
//! ```
//!
//! Closing is `Drop`: a `StreamDecoder` must be dropped before the
//! `ContainerHandle` it came from. The video worker leases the container,
//! so even a worker detached at close releases its decoder first.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend initialization failed: {0}")]
    Init(String),
    #[error("Cannot set log level {level:?}: {reason}")]
    LogLevel { level: LogLevel, reason: String },
    #[error("Cannot open {locator:?}: {reason}")]
    OpenContainer { locator: String, reason: String },
    #[error("Cannot open stream {index}: {reason}")]
    OpenStream { index: usize, reason: String },
    #[error("Packet read failed: {0}")]
    Read(String),
    #[error("Seek to {timestamp_us}us failed: {reason}")]
    Seek { timestamp_us: i64, reason: String },
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

// ============================================================================
// Descriptors
// ============================================================================

/// Backend log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    Panic,
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

impl LogLevel {
    /// Numeric level as understood by the native library
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Quiet => -8,
            Self::Panic => 0,
            Self::Fatal => 8,
            Self::Error => 16,
            Self::Warning => 24,
            Self::Info => 32,
            Self::Verbose => 40,
            Self::Debug => 48,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Quiet
    }
}

/// Audio sample encoding reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    /// Zero when the container carries no aspect information
    pub sample_aspect_num: i32,
    pub sample_aspect_den: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub sample_bits: u32,
    pub channels: u32,
}

/// Per-stream descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamInfo {
    Video(VideoStreamInfo),
    Audio(AudioStreamInfo),
    /// Subtitles, data tracks and anything else we never decode
    Unknown,
}

/// Global container metadata, times in microseconds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub stream_count: usize,
    pub start_time: i64,
    pub duration: i64,
    pub title: String,
    pub author: String,
    pub copyright: String,
    pub comment: String,
    pub album: String,
    pub year: Option<i32>,
    pub track: Option<u32>,
    pub genre: String,
}

/// A packet as read from the container, timestamp in microseconds
#[derive(Debug, Clone)]
pub struct BackendPacket {
    pub stream_index: usize,
    pub timestamp: i64,
    pub data: Bytes,
}

/// Result of one audio decode call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioDecodeResult {
    /// Input bytes used
    pub consumed: usize,
    /// Output bytes written, may be zero
    pub produced: usize,
}

// ============================================================================
// Traits
// ============================================================================

/// An opened stream of a container
pub trait StreamDecoder: Send {
    /// Decode from `input` into `output`. Some codecs need several calls
    /// before any output appears.
    fn decode_audio(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<AudioDecodeResult, BackendError> {
        let _ = (input, output);
        Err(BackendError::Unsupported("audio decode on a non-audio stream".into()))
    }

    /// Decode one packet into a packed RGB24 buffer of the stream geometry.
    fn decode_video(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), BackendError> {
        let _ = (input, output);
        Err(BackendError::Unsupported("video decode on a non-video stream".into()))
    }
}

/// An opened media container
pub trait ContainerHandle: Send {
    fn info(&self) -> ContainerInfo;

    fn stream_info(&self, index: usize) -> Result<StreamInfo, BackendError>;

    fn open_stream(&mut self, index: usize) -> Result<Box<dyn StreamDecoder>, BackendError>;

    /// Next packet in file order, `Ok(None)` at end of input
    fn read_packet(&mut self) -> Result<Option<BackendPacket>, BackendError>;

    fn seek(&mut self, timestamp_us: i64) -> Result<(), BackendError>;
}

/// Native codec library entry points
pub trait Backend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn init(&self) -> Result<(), BackendError>;

    fn set_log_level(&self, level: LogLevel) -> Result<(), BackendError>;

    /// Size of the scratch buffer one audio decode call may fill
    fn audio_buffer_size(&self) -> usize;

    fn has_feature(&self, feature: &str) -> bool {
        let _ = feature;
        false
    }

    fn open_container(&self, locator: &str) -> Result<Box<dyn ContainerHandle>, BackendError>;
}

// ============================================================================
// Initialization
// ============================================================================

/// A backend that has been initialized and had its log level applied.
///
/// Sources can only be opened from one of these, so a broken native library
/// fails once, up front, instead of on every open.
#[derive(Clone)]
pub struct InitializedBackend {
    backend: Arc<dyn Backend>,
    log_level: LogLevel,
}

impl InitializedBackend {
    pub fn new(backend: Arc<dyn Backend>, log_level: LogLevel) -> Result<Self, BackendError> {
        backend.init()?;
        backend.set_log_level(log_level)?;

        tracing::info!(
            "Backend {} v{} ready (log level {:?})",
            backend.name(),
            backend.version(),
            log_level
        );

        Ok(Self { backend, log_level })
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }
}

impl fmt::Debug for InitializedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializedBackend")
            .field("backend", &self.backend.name())
            .field("log_level", &self.log_level)
            .finish()
    }
}
