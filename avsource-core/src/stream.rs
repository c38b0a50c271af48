//! # Streams
//!
//! Stream descriptors and the selection policy: the first video stream and
//! the first playable audio stream win, everything else is ignored for the
//! lifetime of the source.

use crate::backend::{AudioStreamInfo, SampleFormat, StreamDecoder, StreamInfo, VideoStreamInfo};
use crate::container::Container;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Geometry of the decoded video
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    /// Pixel aspect ratio, when the container declares one
    pub sample_aspect: Option<f64>,
}

impl VideoFormat {
    /// Bytes per row of a packed RGB24 image
    pub fn pitch(&self) -> usize {
        self.width as usize * 3
    }

    /// Bytes in one decoded RGB24 image
    pub fn frame_size(&self) -> usize {
        self.pitch() * self.height as usize
    }
}

impl From<&VideoStreamInfo> for VideoFormat {
    fn from(info: &VideoStreamInfo) -> Self {
        let sample_aspect = if info.sample_aspect_num != 0 && info.sample_aspect_den != 0 {
            Some(info.sample_aspect_num as f64 / info.sample_aspect_den as f64)
        } else {
            None
        };
        Self {
            width: info.width,
            height: info.height,
            sample_aspect,
        }
    }
}

/// Layout of decoded PCM
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub channels: u32,
    /// Bits per sample
    pub sample_size: u32,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> u32 {
        self.sample_size / 8
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.bytes_per_sample() * self.channels * self.sample_rate
    }

    /// Formats we can hand to an output device as-is
    pub fn is_playable(&self) -> bool {
        matches!(self.sample_size, 8 | 16) && matches!(self.channels, 1 | 2)
    }
}

impl From<&AudioStreamInfo> for AudioFormat {
    fn from(info: &AudioStreamInfo) -> Self {
        Self {
            channels: info.channels,
            sample_size: info.sample_bits,
            sample_rate: info.sample_rate,
            sample_format: info.sample_format,
        }
    }
}

/// Probed description of one container stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDescriptor {
    Video(VideoFormat),
    Audio(AudioFormat),
    Other,
}

impl StreamDescriptor {
    pub fn kind(&self) -> Option<StreamKind> {
        match self {
            Self::Video(_) => Some(StreamKind::Video),
            Self::Audio(_) => Some(StreamKind::Audio),
            Self::Other => None,
        }
    }
}

impl From<&StreamInfo> for StreamDescriptor {
    fn from(info: &StreamInfo) -> Self {
        match info {
            StreamInfo::Video(video) => Self::Video(video.into()),
            StreamInfo::Audio(audio) => Self::Audio(audio.into()),
            StreamInfo::Unknown => Self::Other,
        }
    }
}

// ============================================================================
// Selection
// ============================================================================

/// A stream adopted for decoding
pub struct ActiveStream<F> {
    pub index: usize,
    pub format: F,
    pub decoder: Box<dyn StreamDecoder>,
}

/// Result of stream selection, at most one stream per kind
#[derive(Default)]
pub struct Selection {
    pub video: Option<ActiveStream<VideoFormat>>,
    pub audio: Option<ActiveStream<AudioFormat>>,
}

impl Selection {
    pub fn video_index(&self) -> Option<usize> {
        self.video.as_ref().map(|s| s.index)
    }

    pub fn audio_index(&self) -> Option<usize> {
        self.audio.as_ref().map(|s| s.index)
    }
}

/// Adopt streams in index order. A stream the backend fails to open is
/// skipped and selection moves on.
pub fn select_streams(container: &mut Container, descriptors: &[StreamDescriptor]) -> Selection {
    let mut selection = Selection::default();

    for (index, descriptor) in descriptors.iter().enumerate() {
        match descriptor {
            StreamDescriptor::Video(format) if selection.video.is_none() => {
                match container.open_stream(index) {
                    Ok(decoder) => {
                        tracing::info!(
                            "Video stream {}: {}x{} (aspect {:?})",
                            index,
                            format.width,
                            format.height,
                            format.sample_aspect
                        );
                        selection.video = Some(ActiveStream {
                            index,
                            format: format.clone(),
                            decoder,
                        });
                    }
                    Err(e) => tracing::warn!("Skipping video stream {}: {}", index, e),
                }
            }
            StreamDescriptor::Audio(format) if selection.audio.is_none() && format.is_playable() => {
                match container.open_stream(index) {
                    Ok(decoder) => {
                        tracing::info!(
                            "Audio stream {}: {} ch, {} bit, {} Hz",
                            index,
                            format.channels,
                            format.sample_size,
                            format.sample_rate
                        );
                        selection.audio = Some(ActiveStream {
                            index,
                            format: format.clone(),
                            decoder,
                        });
                    }
                    Err(e) => tracing::warn!("Skipping audio stream {}: {}", index, e),
                }
            }
            _ => tracing::debug!("Ignoring stream {}: {:?}", index, descriptor.kind()),
        }
    }

    selection
}
