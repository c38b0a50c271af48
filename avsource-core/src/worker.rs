//! # Video Decode Worker
//!
//! One background thread per source that turns raw video packets into RGB24
//! images, so expensive video decode never sits on the audio path.
//!
//! ```text
//! ┌────────┐  VideoJob   ┌────────┐  DecodedImage  ┌───────────┐
//! │ Router │────────────►│ Worker │───────────────►│ Presenter │
//! └────────┘  (Block)    └────────┘  (DropOldest)  └───────────┘
//! ```
//!
//! Every job and image carries the seek epoch it belongs to. A seek bumps
//! the epoch, so whatever the worker had in flight is dropped instead of
//! leaking into the new position.
//!
//! The thread holds a [`ContainerLease`] and drops it only after its decoder,
//! so a worker detached mid-decode never outlives the container.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::backend::StreamDecoder;
use crate::config::SourceConfig;
use crate::container::ContainerLease;
use crate::packet::RawPacket;
use crate::queue::{BoundedQueue, PushOutcome};
use crate::stats::Counters;
use crate::stream::VideoFormat;

/// A decoded RGB24 picture
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub pitch: usize,
    pub data: Bytes,
}

/// An image and the time it should appear, in seconds
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub timestamp: f64,
    pub image: Image,
    pub(crate) epoch: u64,
}

impl DecodedImage {
    pub fn new(timestamp: f64, image: Image, epoch: u64) -> Self {
        Self {
            timestamp,
            image,
            epoch,
        }
    }
}

#[derive(Debug)]
pub struct VideoJob {
    pub packet: RawPacket,
    pub epoch: u64,
}

/// Seek generation shared by the caller and the worker
#[derive(Debug, Clone, Default)]
pub struct SeekEpoch(Arc<AtomicU64>);

impl SeekEpoch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Start a new generation, returning it
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Producer end of the worker's input queue
#[derive(Clone)]
pub struct VideoFeed {
    queue: Arc<BoundedQueue<VideoJob>>,
    epoch: SeekEpoch,
    counters: Arc<Counters>,
}

impl VideoFeed {
    pub fn send(&self, packet: RawPacket) {
        let job = VideoJob {
            packet,
            epoch: self.epoch.current(),
        };
        match self.queue.push(job) {
            PushOutcome::Queued => {}
            PushOutcome::Evicted => {
                Counters::bump(&self.counters.buffer_overflows);
                tracing::warn!("Video packet queue full, dropped oldest packet");
            }
            PushOutcome::Closed => tracing::trace!("Video packet queue closed"),
        }
    }

    /// True if `send` would not wait for the worker
    pub fn has_room(&self) -> bool {
        !self.queue.is_full()
    }
}

pub struct VideoDecodeWorker {
    packets: Arc<BoundedQueue<VideoJob>>,
    images: Arc<BoundedQueue<DecodedImage>>,
    epoch: SeekEpoch,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl VideoDecodeWorker {
    pub fn spawn(
        decoder: Box<dyn StreamDecoder>,
        format: VideoFormat,
        config: &SourceConfig,
        epoch: SeekEpoch,
        counters: Arc<Counters>,
        container: ContainerLease,
    ) -> std::io::Result<Self> {
        let packets = Arc::new(BoundedQueue::new(
            config.video_packet_capacity,
            config.video_packet_policy,
        ));
        let images = Arc::new(BoundedQueue::new(
            config.video_image_capacity,
            config.video_image_policy,
        ));

        let handle = {
            let packets = Arc::clone(&packets);
            let images = Arc::clone(&images);
            let epoch = epoch.clone();
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("avsource-video".into())
                .spawn(move || {
                    decode_loop(decoder, format, packets, images, epoch, counters);
                    drop(container);
                })?
        };

        tracing::debug!("Video decode worker started");

        Ok(Self {
            packets,
            images,
            epoch,
            counters,
            handle: Some(handle),
        })
    }

    pub fn feed(&self) -> VideoFeed {
        VideoFeed {
            queue: Arc::clone(&self.packets),
            epoch: self.epoch.clone(),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn images(&self) -> &BoundedQueue<DecodedImage> {
        &self.images
    }

    /// Drop every queued packet and image
    pub fn clear(&self) {
        let packets = self.packets.clear();
        let images = self.images.clear();
        Counters::add(&self.counters.stale_images, images as u64);
        tracing::debug!("Worker queues cleared ({} packets, {} images)", packets, images);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait up to `timeout` for it to exit. Returns
    /// false if the thread was still busy and got detached; it then exits,
    /// releasing its decoder and container lease, once the current decode
    /// call returns.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.packets.close();
        self.images.close();

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("Video worker still decoding after {:?}, detaching", timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if handle.join().is_err() {
            tracing::error!("Video worker panicked");
        }
        tracing::debug!("Video decode worker stopped");
        true
    }
}

impl Drop for VideoDecodeWorker {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(2));
    }
}

fn decode_loop(
    mut decoder: Box<dyn StreamDecoder>,
    format: VideoFormat,
    packets: Arc<BoundedQueue<VideoJob>>,
    images: Arc<BoundedQueue<DecodedImage>>,
    epoch: SeekEpoch,
    counters: Arc<Counters>,
) {
    while let Some(job) = packets.pop() {
        if job.epoch != epoch.current() {
            continue;
        }

        let mut buffer = vec![0u8; format.frame_size()];
        if let Err(e) = decoder.decode_video(&job.packet.data, &mut buffer) {
            Counters::bump(&counters.video_decode_errors);
            tracing::warn!("Dropping video packet at {:.3}s: {}", job.packet.seconds(), e);
            continue;
        }
        Counters::bump(&counters.images_decoded);

        // seek landed while we were decoding
        if job.epoch != epoch.current() {
            Counters::bump(&counters.stale_images);
            continue;
        }

        let image = DecodedImage {
            timestamp: job.packet.seconds(),
            image: Image {
                width: format.width,
                height: format.height,
                pitch: format.pitch(),
                data: Bytes::from(buffer),
            },
            epoch: job.epoch,
        };

        match images.push(image) {
            PushOutcome::Queued => {}
            PushOutcome::Evicted => {
                Counters::bump(&counters.buffer_overflows);
                Counters::bump(&counters.images_skipped);
            }
            PushOutcome::Closed => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InitializedBackend;
    use crate::container::Container;
    use crate::memory::{DecodeGate, GatedRgbDecoder, MemoryBackend, MemoryClip, TiledRgbDecoder};

    fn format() -> VideoFormat {
        VideoFormat {
            width: 2,
            height: 2,
            sample_aspect: None,
        }
    }

    fn wait_for_images(worker: &VideoDecodeWorker, n: usize) -> Vec<DecodedImage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < n && Instant::now() < deadline {
            match worker.images().try_pop() {
                Some(image) => out.push(image),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        out
    }

    fn container() -> (Arc<MemoryBackend>, Container) {
        let memory = Arc::new(MemoryBackend::new());
        memory.insert("clip", MemoryClip::new());
        let backend = InitializedBackend::new(memory.clone(), Default::default()).unwrap();
        let container = Container::open(&backend, "clip").unwrap();
        (memory, container)
    }

    fn spawn(epoch: SeekEpoch, counters: Arc<Counters>) -> VideoDecodeWorker {
        let (_, container) = container();
        VideoDecodeWorker::spawn(
            Box::new(TiledRgbDecoder),
            format(),
            &SourceConfig::default(),
            epoch,
            counters,
            container.lease(),
        )
        .unwrap()
    }

    #[test]
    fn test_decodes_in_feed_order() {
        let counters = Arc::new(Counters::default());
        let mut worker = spawn(SeekEpoch::default(), counters.clone());
        let feed = worker.feed();

        feed.send(RawPacket::new(0, 0, vec![10, 20, 30]));
        feed.send(RawPacket::new(0, 40_000, vec![1, 2, 3]));

        let images = wait_for_images(&worker, 2);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].timestamp, 0.0);
        assert_eq!(images[1].timestamp, 0.04);
        assert_eq!(images[0].image.pitch, 6);
        assert_eq!(&images[0].image.data[..6], &[10, 20, 30, 10, 20, 30]);
        assert!(worker.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_decode_failure_produces_nothing() {
        let counters = Arc::new(Counters::default());
        let mut worker = spawn(SeekEpoch::default(), counters.clone());
        let feed = worker.feed();

        feed.send(RawPacket::new(0, 0, Vec::new()));
        feed.send(RawPacket::new(0, 40_000, vec![9, 9, 9]));

        let images = wait_for_images(&worker, 1);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].timestamp, 0.04);
        assert!(worker.shutdown(Duration::from_secs(1)));
        assert_eq!(counters.snapshot().video_decode_errors, 1);
    }

    #[test]
    fn test_stale_jobs_skipped() {
        let counters = Arc::new(Counters::default());
        let epoch = SeekEpoch::default();
        let mut worker = spawn(epoch.clone(), counters.clone());
        let feed = worker.feed();

        let old = epoch.current();
        epoch.advance();
        worker.packets.push(VideoJob {
            packet: RawPacket::new(0, 0, vec![1, 1, 1]),
            epoch: old,
        });
        feed.send(RawPacket::new(0, 80_000, vec![2, 2, 2]));

        let images = wait_for_images(&worker, 1);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].timestamp, 0.08);
        assert_eq!(images[0].epoch, epoch.current());
        assert!(worker.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn test_shutdown_stops_idle_worker() {
        let mut worker = spawn(SeekEpoch::default(), Arc::new(Counters::default()));
        assert!(worker.is_running());
        assert!(worker.shutdown(Duration::from_secs(1)));
        assert!(!worker.is_running());
        // second call is a no-op
        assert!(worker.shutdown(Duration::from_millis(1)));
    }

    #[test]
    fn test_feed_room_follows_packet_capacity() {
        let (_, container) = container();
        let gate = DecodeGate::new();
        let config = SourceConfig {
            video_packet_capacity: 2,
            ..Default::default()
        };
        let worker = VideoDecodeWorker::spawn(
            Box::new(GatedRgbDecoder::new(gate.clone())),
            format(),
            &config,
            SeekEpoch::default(),
            Arc::new(Counters::default()),
            container.lease(),
        )
        .unwrap();
        let feed = worker.feed();

        // first packet is taken by the worker and held at the gate
        feed.send(RawPacket::new(0, 0, vec![1, 1, 1]));
        assert!(gate.wait_entered(1, Duration::from_secs(5)));
        feed.send(RawPacket::new(0, 40_000, vec![2, 2, 2]));
        assert!(feed.has_room());
        feed.send(RawPacket::new(0, 80_000, vec![3, 3, 3]));
        assert!(!feed.has_room());

        gate.open();
        assert_eq!(wait_for_images(&worker, 3).len(), 3);
        assert!(feed.has_room());
    }

    #[test]
    fn test_detached_worker_keeps_container_open() {
        let (memory, container) = container();
        let gate = DecodeGate::new();
        let mut worker = VideoDecodeWorker::spawn(
            Box::new(GatedRgbDecoder::new(gate.clone())),
            format(),
            &SourceConfig::default(),
            SeekEpoch::default(),
            Arc::new(Counters::default()),
            container.lease(),
        )
        .unwrap();

        worker.feed().send(RawPacket::new(0, 0, vec![1, 2, 3]));
        assert!(gate.wait_entered(1, Duration::from_secs(5)));

        assert!(!worker.shutdown(Duration::from_millis(10)));
        drop(container);
        // decoder is still inside decode_video
        assert_eq!(memory.open_containers(), 1);

        gate.open();
        let deadline = Instant::now() + Duration::from_secs(5);
        while memory.open_containers() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(memory.open_containers(), 0);
    }
}
