//! Bounded single-producer/single-consumer rings between the sampler
//! threads and the writer.
//!
//! Overflow policy: the newest sample is dropped and counted, never
//! blocking the producer. With the writer draining every millisecond
//! the counters stay at zero in normal operation; a non-zero count in
//! the status output means the writer could not keep up.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

pub(crate) struct SampleRing<T> {
    queue: ArrayQueue<T>,
    overflow: AtomicU64,
}

impl<T> SampleRing<T> {
    pub fn with_capacity(capacity: usize) -> SampleRing<T> {
        SampleRing {
            queue: ArrayQueue::new(capacity),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn push(&self, value: T) {
        if self.queue.push(value).is_err() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

/// Ring capacity for a tier: at least one second of samples at the
/// configured rate, and never below the tier floor.
pub(crate) fn tier_capacity(hz: u32, floor: usize) -> usize {
    floor.max(2 * hz as usize)
}
