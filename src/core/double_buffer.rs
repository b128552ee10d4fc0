//! Double-buffered mailbox for results produced off the update thread
//!
//! Producers append to the back buffer while the consumer drains the front
//! buffer. A swap exchanges the two under one short lock, so the consumer
//! never iterates a list that a loader thread is still writing.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Counters describing mailbox traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxMetrics {
    /// Total number of buffer swaps
    pub swap_count: u64,
    /// Items posted by producers
    pub posted: u64,
    /// Items handed to the consumer
    pub drained: u64,
}

struct Buffers<T> {
    front: Vec<T>,
    back: Vec<T>,
    metrics: MailboxMetrics,
}

/// Ping-pong item list shared between loader threads and the update thread
pub struct Mailbox<T> {
    buffers: Mutex<Buffers<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Buffers {
                front: Vec::with_capacity(capacity),
                back: Vec::with_capacity(capacity),
                metrics: MailboxMetrics::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffers<T>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one item to the back buffer
    pub fn add(&self, item: T) {
        let mut buffers = self.lock();
        buffers.back.push(item);
        buffers.metrics.posted += 1;
    }

    /// Append several items under a single lock
    pub fn add_all<I: IntoIterator<Item = T>>(&self, items: I) {
        let mut buffers = self.lock();
        let before = buffers.back.len();
        buffers.back.extend(items);
        let added = (buffers.back.len() - before) as u64;
        buffers.metrics.posted += added;
    }

    /// Swap buffers and hand everything posted since the last swap to the caller
    pub fn switch_and_get(&self) -> Vec<T> {
        let mut buffers = self.lock();
        let Buffers { front, back, metrics } = &mut *buffers;
        std::mem::swap(front, back);
        back.clear();
        metrics.swap_count += 1;
        metrics.drained += front.len() as u64;
        std::mem::take(front)
    }

    /// Number of items waiting for the next swap
    pub fn pending(&self) -> usize {
        self.lock().back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn metrics(&self) -> MailboxMetrics {
        self.lock().metrics
    }
}
