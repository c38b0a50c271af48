//! # Source
//!
//! One opened media container with at most one audio and one video stream
//! adopted. Everything here runs on the caller's thread except video decode.
//!
//! ```text
//!                ┌──────────────┐ next_audio_chunk ┌────────────────┐
//! Container ────►│ PacketRouter │─────────────────►│ AudioDecodePath│──► chunks + sync events
//!                └──────┬───────┘                  └────────────────┘
//!                       │ video packets
//!                       ▼
//!                ┌──────────────┐   images   ┌───────────────────────────┐
//!                │ Decode worker│───────────►│ VideoPresentationSelector │──► frame_at
//!                └──────────────┘            └───────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::audio::{AudioDecodePath, DecodedAudioChunk};
use crate::backend::{BackendError, ContainerInfo, InitializedBackend};
use crate::config::SourceConfig;
use crate::container::Container;
use crate::presenter::VideoPresentationSelector;
use crate::router::PacketRouter;
use crate::stats::{Counters, SourceStats};
use crate::stream::{select_streams, AudioFormat, Selection, StreamDescriptor, VideoFormat};
use crate::worker::{Image, SeekEpoch, VideoDecodeWorker};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Cannot read {locator:?} as media: {reason}")]
    Format { locator: String, reason: String },
    #[error("Seek to {target:.3}s failed: {source}")]
    Seek { target: f64, source: BackendError },
    #[error("Invalid source configuration: {0}")]
    Config(String),
    #[error("Cannot start video decode worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Video decode state, present only when a video stream was adopted
struct VideoPath {
    format: VideoFormat,
    worker: VideoDecodeWorker,
    presenter: VideoPresentationSelector,
}

// Field order is teardown order: streams go before the container the router
// owns. A detached worker keeps its own lease on the container.
pub struct Source {
    video: Option<VideoPath>,
    audio: Option<AudioDecodePath>,
    router: PacketRouter,
    streams: Vec<StreamDescriptor>,
    epoch: SeekEpoch,
    counters: Arc<Counters>,
    config: SourceConfig,
    closed: bool,
}

impl Source {
    /// Open `locator` and start decoding. Fails only if the container itself
    /// cannot be read; streams that fail to open are skipped.
    pub fn open(
        backend: &InitializedBackend,
        locator: &str,
        config: SourceConfig,
    ) -> Result<Self, SourceError> {
        config.validate().map_err(SourceError::Config)?;

        let mut container =
            Container::open(backend, locator).map_err(|e| SourceError::Format {
                locator: locator.to_string(),
                reason: e.to_string(),
            })?;

        let probe = container.probe();
        let selection = select_streams(&mut container, &probe.streams);
        if selection.video.is_none() && selection.audio.is_none() {
            tracing::warn!("{:?} has no playable streams", locator);
        }

        let counters = Arc::new(Counters::default());
        let epoch = SeekEpoch::default();
        let lease = container.lease();

        let mut router = PacketRouter::new(
            container,
            selection.video_index(),
            selection.audio_index(),
            config.packet_buffer_capacity,
            Arc::clone(&counters),
        );

        let Selection { video, audio } = selection;

        let audio = audio.map(|stream| {
            AudioDecodePath::new(
                stream,
                backend.backend().audio_buffer_size(),
                Arc::clone(&counters),
            )
        });

        let video = match video {
            Some(stream) => {
                let format = stream.format.clone();
                let worker = VideoDecodeWorker::spawn(
                    stream.decoder,
                    stream.format,
                    &config,
                    epoch.clone(),
                    Arc::clone(&counters),
                    lease,
                )?;
                router.attach_video_feed(worker.feed());
                Some(VideoPath {
                    format,
                    worker,
                    presenter: VideoPresentationSelector::new(Arc::clone(&counters)),
                })
            }
            None => None,
        };

        Ok(Self {
            video,
            audio,
            router,
            streams: probe.streams,
            epoch,
            counters,
            config,
            closed: false,
        })
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn locator(&self) -> &str {
        self.router.container().locator()
    }

    pub fn info(&self) -> &ContainerInfo {
        self.router.container().info()
    }

    /// Seconds
    pub fn duration(&self) -> f64 {
        self.router.container().duration()
    }

    /// Every stream in the container, adopted or not
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn video_format(&self) -> Option<&VideoFormat> {
        self.video.as_ref().map(|v| &v.format)
    }

    pub fn audio_format(&self) -> Option<&AudioFormat> {
        self.audio.as_ref().map(|a| a.format())
    }

    /// Timestamp of the last image `frame_at` returned since open or seek
    pub fn last_frame_timestamp(&self) -> Option<f64> {
        self.video.as_ref()?.presenter.last_timestamp()
    }

    pub fn stats(&self) -> SourceStats {
        self.counters.snapshot()
    }

    // ========================================================================
    // Playback
    // ========================================================================

    /// Next decoded audio chunk, `None` at end of input or without audio
    pub fn next_audio_chunk(&mut self) -> Option<DecodedAudioChunk> {
        let audio = self.audio.as_mut()?;
        audio.next_chunk(&mut self.router)
    }

    /// Image due at `timestamp` seconds. Never waits for the decoder.
    pub fn frame_at(&mut self, timestamp: f64) -> Option<Image> {
        let video = self.video.as_mut()?;

        // nothing else reads ahead when there is no audio
        if self.audio.is_none() {
            self.router.feed_video_until(timestamp);
        }

        video
            .presenter
            .frame_at(video.worker.images(), self.epoch.current(), timestamp)
    }

    /// Jump to `target` seconds. Buffered packets, queued images and the
    /// held audio packet are all dropped, even when the backend fails to
    /// reposition.
    pub fn seek(&mut self, target: f64) -> Result<(), SourceError> {
        let target = target.max(0.0);
        let epoch = self.epoch.advance();

        let result = self.router.seek(target);

        if let Some(video) = &mut self.video {
            video.worker.clear();
            video.presenter.reset();
        }
        if let Some(audio) = &mut self.audio {
            audio.reset(target);
        }
        Counters::bump(&self.counters.seeks);

        match result {
            Ok(()) => {
                tracing::debug!("Seeked to {:.3}s (epoch {})", target, epoch);
                Ok(())
            }
            Err(source) => {
                tracing::warn!("Seek to {:.3}s failed: {}", target, source);
                Err(SourceError::Seek { target, source })
            }
        }
    }

    /// Stop the decode worker and release the container
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(video) = &mut self.video {
            let timeout = Duration::from_millis(self.config.worker_join_timeout_ms);
            if !video.worker.shutdown(timeout) {
                tracing::warn!("Container stays open until the detached video worker exits");
            }
        }

        tracing::info!(
            "Closed {:?} ({} packets read)",
            self.locator(),
            self.counters.snapshot().packets_read
        );
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;
    use crate::memory::{DecodeGate, MemoryBackend, MemoryClip, MemoryStream};
    use std::thread;
    use std::time::Instant;

    fn backend(locator: &str, clip: MemoryClip) -> InitializedBackend {
        let memory = Arc::new(MemoryBackend::new());
        memory.insert(locator, clip);
        InitializedBackend::new(memory, Default::default()).unwrap()
    }

    /// Poll `frame_at` until it yields or the deadline passes
    fn wait_for_frame(source: &mut Source, timestamp: f64) -> Option<Image> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(image) = source.frame_at(timestamp) {
                return Some(image);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_unreadable_container_is_format_error() {
        let backend = backend("clip", MemoryClip::new());
        let err = Source::open(&backend, "missing.mkv", SourceConfig::default())
            .err()
            .unwrap();

        match err {
            SourceError::Format { locator, .. } => assert_eq!(locator, "missing.mkv"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let backend = backend("clip", MemoryClip::new());
        let config = SourceConfig {
            video_image_policy: BackpressurePolicy::Block,
            ..Default::default()
        };
        assert!(matches!(
            Source::open(&backend, "clip", config),
            Err(SourceError::Config(_))
        ));
    }

    #[test]
    fn test_audio_only_has_no_frames() {
        let backend = backend(
            "clip",
            MemoryClip::new()
                .with_duration(1_000_000)
                .with_stream(MemoryStream::audio(8_000, 1, 8))
                .with_packet(0, 0, vec![0; 80]),
        );
        let mut source = Source::open(&backend, "clip", SourceConfig::default()).unwrap();

        assert!(source.video_format().is_none());
        assert_eq!(source.audio_format().unwrap().sample_rate, 8_000);
        assert_eq!(source.duration(), 1.0);
        assert!(source.frame_at(0.0).is_none());
        assert!(source.next_audio_chunk().is_some());
        assert!(source.next_audio_chunk().is_none());
    }

    #[test]
    fn test_video_only_pumps_router() {
        let backend = backend(
            "clip",
            MemoryClip::new()
                .with_stream(MemoryStream::video(2, 1))
                .with_packet(0, 0, vec![1, 2, 3])
                .with_packet(0, 40_000, vec![4, 5, 6]),
        );
        let mut source = Source::open(&backend, "clip", SourceConfig::default()).unwrap();

        assert!(source.next_audio_chunk().is_none());
        let image = wait_for_frame(&mut source, 0.0).unwrap();
        assert_eq!(&image.data[..], &[1, 2, 3, 1, 2, 3]);
        assert_eq!(image.pitch, 6);
    }

    #[test]
    fn test_failed_seek_still_clears_state() {
        let backend = backend(
            "clip",
            MemoryClip::new()
                .failing_seek()
                .with_stream(MemoryStream::audio(8_000, 1, 8))
                .with_packet(0, 0, vec![0; 800])
                .with_packet(0, 100_000, vec![0; 800]),
        );
        let mut source = Source::open(&backend, "clip", SourceConfig::default()).unwrap();
        assert!(source.next_audio_chunk().is_some());

        let err = source.seek(5.0).unwrap_err();
        assert!(matches!(err, SourceError::Seek { target, .. } if target == 5.0));
        assert_eq!(source.stats().seeks, 1);

        // the container never moved, so the next packet reseeds the clock
        let chunk = source.next_audio_chunk().unwrap();
        assert_eq!(chunk.timestamp, 0.1);
    }

    #[test]
    fn test_close_stops_worker() {
        let backend = backend(
            "clip",
            MemoryClip::new()
                .with_stream(MemoryStream::video(2, 2))
                .with_stream(MemoryStream::audio(8_000, 1, 8)),
        );
        let source = Source::open(
            &backend,
            "clip",
            SourceConfig {
                worker_join_timeout_ms: 500,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(source.video.as_ref().unwrap().worker.is_running());
        source.close();
    }

    #[test]
    fn test_video_only_frame_at_never_waits_for_worker() {
        let gate = DecodeGate::new();
        let mut clip = MemoryClip::new().with_stream(MemoryStream::video(2, 2).with_decode_gate(gate.clone()));
        for i in 0..50 {
            clip = clip.with_packet(0, i * 40_000, vec![1, 2, 3]);
        }
        let backend = backend("clip", clip);
        let config = SourceConfig {
            video_packet_capacity: 2,
            ..Default::default()
        };
        let mut source = Source::open(&backend, "clip", config).unwrap();

        // releases the decoder eventually even if frame_at blocks
        let release = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(3));
            release.open();
        });

        let started = Instant::now();
        assert!(source.frame_at(10.0).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        gate.open();
        assert!(wait_for_frame(&mut source, 10.0).is_some());
    }

    #[test]
    fn test_container_outlives_detached_worker() {
        let gate = DecodeGate::new();
        let memory = Arc::new(MemoryBackend::new());
        memory.insert(
            "clip",
            MemoryClip::new()
                .with_stream(MemoryStream::video(2, 2).with_decode_gate(gate.clone()))
                .with_stream(MemoryStream::audio(8_000, 1, 8))
                .with_packet(0, 0, vec![1, 2, 3])
                .with_packet(1, 0, vec![0; 80]),
        );
        let backend = InitializedBackend::new(memory.clone(), Default::default()).unwrap();
        let config = SourceConfig {
            worker_join_timeout_ms: 10,
            ..Default::default()
        };
        let mut source = Source::open(&backend, "clip", config).unwrap();

        assert!(source.next_audio_chunk().is_some());
        assert!(gate.wait_entered(1, Duration::from_secs(5)));

        source.close();
        assert_eq!(memory.open_containers(), 1);

        gate.open();
        let deadline = Instant::now() + Duration::from_secs(5);
        while memory.open_containers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(memory.open_containers(), 0);
    }
}
