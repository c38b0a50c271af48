//! # avsource core
//!
//! Demultiplexing, buffering and audio/video synchronization for a single
//! media container. Audio is decoded on the caller's thread and drives the
//! clock; video is decoded on one background thread per source and picked
//! by timestamp with [`Source::frame_at`].

// ============================================================================
// Backend
// ============================================================================
pub mod backend;
pub mod memory;
pub mod timestamp;

// ============================================================================
// Container / Streams
// ============================================================================
pub mod container;
pub mod packet;
pub mod router;
pub mod stream;

// ============================================================================
// Decode
// ============================================================================
pub mod audio;
pub mod presenter;
pub mod queue;
pub mod worker;

// ============================================================================
// Source
// ============================================================================
pub mod config;
pub mod source;
pub mod stats;

pub use audio::{DecodedAudioChunk, SyncEvent, SyncEventKind};
pub use backend::{Backend, BackendError, ContainerInfo, InitializedBackend, LogLevel, SampleFormat};
pub use config::{BackpressurePolicy, SourceConfig};
pub use source::{Source, SourceError};
pub use stats::SourceStats;
pub use stream::{AudioFormat, StreamDescriptor, StreamKind, VideoFormat};
pub use worker::Image;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
