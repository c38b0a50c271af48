//! # Video Presentation
//!
//! Picks the image to show at a playback instant. Only the newest image whose
//! timestamp has been reached is returned; older ones it superseded are
//! dropped (frame skipping when decode lags) and future ones wait in
//! `pending`. Never blocks on the worker.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::queue::BoundedQueue;
use crate::stats::Counters;
use crate::worker::{DecodedImage, Image};

pub struct VideoPresentationSelector {
    /// Dequeued but not yet due, oldest first
    pending: VecDeque<DecodedImage>,
    /// Set at open and by seek: present the next image even if it is not
    /// newer than the last one shown
    force_next: bool,
    last_timestamp: Option<f64>,
    counters: Arc<Counters>,
}

impl VideoPresentationSelector {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            pending: VecDeque::new(),
            force_next: true,
            last_timestamp: None,
            counters,
        }
    }

    /// Timestamp of the last image returned since open or seek
    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Image due at `timestamp` seconds, if any. `epoch` is the current seek
    /// generation; images from earlier generations are discarded.
    pub fn frame_at(
        &mut self,
        images: &BoundedQueue<DecodedImage>,
        epoch: u64,
        timestamp: f64,
    ) -> Option<Image> {
        let mut result: Option<DecodedImage> = None;
        let mut found_future = false;

        while let Some(front) = self.pending.front() {
            if front.timestamp > timestamp {
                found_future = true;
                break;
            }
            let image = self.pending.pop_front();
            self.supersede(&mut result, image);
        }

        if found_future && result.is_some() {
            return self.present(result);
        }

        if !found_future {
            while let Some(image) = images.try_pop() {
                if image.epoch != epoch {
                    Counters::bump(&self.counters.stale_images);
                    continue;
                }
                if image.timestamp <= timestamp {
                    self.supersede(&mut result, Some(image));
                } else {
                    self.pending.push_back(image);
                    break;
                }
            }
        }

        self.present(result)
    }

    /// Forget everything held, ready for a new position
    pub fn reset(&mut self) {
        self.pending.clear();
        self.force_next = true;
        self.last_timestamp = None;
    }

    fn supersede(&self, result: &mut Option<DecodedImage>, image: Option<DecodedImage>) {
        if result.is_some() {
            Counters::bump(&self.counters.images_skipped);
        }
        *result = image;
    }

    fn present(&mut self, result: Option<DecodedImage>) -> Option<Image> {
        let image = result?;

        let duplicate = self
            .last_timestamp
            .is_some_and(|last| image.timestamp <= last);
        if duplicate && !self.force_next {
            Counters::bump(&self.counters.images_skipped);
            tracing::trace!("Suppressing image at {:.3}s", image.timestamp);
            return None;
        }

        self.force_next = false;
        self.last_timestamp = Some(image.timestamp);
        Counters::bump(&self.counters.images_presented);
        Some(image.image)
    }
}
