//! # Bounded Queue
//!
//! Thread-safe FIFO used at the caller/worker boundary: blocking `pop` for the
//! worker, non-blocking `try_pop` for the caller, `close` to release anyone
//! waiting, and a per-queue backpressure policy.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::config::BackpressurePolicy;

/// What happened to a pushed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item
    Evicted,
    /// Queue closed, item discarded
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    /// Push an item, applying the backpressure policy when full
    pub fn push(&self, item: T) -> PushOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        match self.policy {
            BackpressurePolicy::Block => {
                while inner.items.len() >= self.capacity && !inner.closed {
                    self.not_full.wait(&mut inner);
                }
            }
            BackpressurePolicy::DropOldest => {
                while inner.items.len() >= self.capacity {
                    inner.items.pop_front();
                    outcome = PushOutcome::Evicted;
                }
            }
        }

        if inner.closed {
            return PushOutcome::Closed;
        }

        inner.items.push_back(item);
        self.not_empty.notify_one();
        outcome
    }

    /// Wait for an item. Returns `None` once the queue is closed, even if
    /// items are still queued.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Take an item if one is ready
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Discard everything queued, returning how many items were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.items.len();
        inner.items.clear();
        self.not_full.notify_all();
        count
    }

    /// Stop the queue and wake every waiter
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// True when a `Block` push would wait
    pub fn is_full(&self) -> bool {
        self.inner.lock().items.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(4, BackpressurePolicy::Block);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest() {
        let queue = BoundedQueue::new(2, BackpressurePolicy::DropOldest);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Queued);
        assert_eq!(queue.push(3), PushOutcome::Evicted);

        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
    }

    #[test]
    fn test_blocking_push_waits_for_consumer() {
        let queue = Arc::new(BoundedQueue::new(1, BackpressurePolicy::Block));
        queue.push(1);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(1));

        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn test_is_full_tracks_capacity() {
        let queue = BoundedQueue::new(2, BackpressurePolicy::Block);
        queue.push(1);
        assert!(!queue.is_full());
        queue.push(2);
        assert!(queue.is_full());

        queue.try_pop();
        assert!(!queue.is_full());
    }

    #[test]
    fn test_close_releases_blocked_pop() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4, BackpressurePolicy::Block));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(queue.push(7), PushOutcome::Closed);
    }

    #[test]
    fn test_close_releases_blocked_push() {
        let queue = Arc::new(BoundedQueue::new(1, BackpressurePolicy::Block));
        queue.push(1);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(producer.join().unwrap(), PushOutcome::Closed);
    }

    #[test]
    fn test_clear() {
        let queue = BoundedQueue::new(8, BackpressurePolicy::Block);
        for i in 0..5 {
            queue.push(i);
        }

        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        // still open
        assert_eq!(queue.push(9), PushOutcome::Queued);
    }
}
