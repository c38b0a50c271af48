//! Source statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters, shared between the caller thread and the video worker
#[derive(Debug, Default)]
pub struct Counters {
    pub packets_read: AtomicU64,
    pub packets_discarded: AtomicU64,
    pub negative_timestamps: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub audio_decode_errors: AtomicU64,
    pub audio_chunks: AtomicU64,
    pub video_decode_errors: AtomicU64,
    pub images_decoded: AtomicU64,
    pub images_presented: AtomicU64,
    pub images_skipped: AtomicU64,
    pub stale_images: AtomicU64,
    pub seeks: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SourceStats {
            packets_read: load(&self.packets_read),
            packets_discarded: load(&self.packets_discarded),
            negative_timestamps: load(&self.negative_timestamps),
            buffer_overflows: load(&self.buffer_overflows),
            audio_decode_errors: load(&self.audio_decode_errors),
            audio_chunks: load(&self.audio_chunks),
            video_decode_errors: load(&self.video_decode_errors),
            images_decoded: load(&self.images_decoded),
            images_presented: load(&self.images_presented),
            images_skipped: load(&self.images_skipped),
            stale_images: load(&self.stale_images),
            seeks: load(&self.seeks),
        }
    }
}

/// Point-in-time copy of `Counters`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub packets_read: u64,
    /// Packets of streams nobody selected
    pub packets_discarded: u64,
    /// Video packets dropped for a negative timestamp
    pub negative_timestamps: u64,
    /// Packets or images evicted from a full queue
    pub buffer_overflows: u64,
    pub audio_decode_errors: u64,
    pub audio_chunks: u64,
    pub video_decode_errors: u64,
    pub images_decoded: u64,
    pub images_presented: u64,
    /// Images superseded by a newer one before being presented
    pub images_skipped: u64,
    /// Images decoded from packets read before a seek
    pub stale_images: u64,
    pub seeks: u64,
}
