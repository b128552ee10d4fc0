//! Fixed worker pool with a priority queue and cooperative cancellation.
//!
//! Jobs carry an integer priority (higher runs first, FIFO within equal
//! priority) and a [`CancelToken`]. Cancelled jobs that are still queued are
//! skipped by workers and can be dropped eagerly with [`TilePool::purge`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ClipmapError, ClipmapResult};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared cancellation flag checked by queued and running jobs.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

struct QueueEntry {
    priority: i32,
    sequence: u64,
    cancel: CancelToken,
    job: Job,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueEntry {}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<QueueEntry>,
    sequence: u64,
    in_flight: usize,
    completed: u64,
    skipped: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Worker {
    id: usize,
    handle: Option<thread::JoinHandle<()>>,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub skipped: u64,
}

/// Priority worker pool shared by every grid cache of a terrain.
pub struct TilePool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
    size: usize,
}

impl TilePool {
    /// Spawn `size` named worker threads.
    pub fn new(size: usize) -> ClipmapResult<Self> {
        Self::with_name(size, "tile-worker")
    }

    pub fn with_name(size: usize, name: &str) -> ClipmapResult<Self> {
        if size == 0 {
            return Err(ClipmapError::configuration("tile pool needs at least one worker"));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let shared_c = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || worker_loop(shared_c))?;
            workers.push(Worker {
                id,
                handle: Some(handle),
            });
        }

        log::debug!("started tile pool '{}' with {} workers", name, size);

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Default worker count: available parallelism minus one, at least one.
    pub fn default_size() -> usize {
        thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Returns false once the pool has shut down.
    pub fn submit<F>(&self, priority: i32, cancel: CancelToken, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(AtomicOrdering::SeqCst) {
            return false;
        }
        let mut st = self.shared.lock();
        st.sequence = st.sequence.wrapping_add(1);
        let sequence = st.sequence;
        st.queue.push(QueueEntry {
            priority,
            sequence,
            cancel,
            job: Box::new(f),
        });
        self.shared.cv.notify_one();
        true
    }

    /// Drop queued jobs whose token was cancelled. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut st = self.shared.lock();
        let before = st.queue.len();
        st.queue.retain(|entry| !entry.cancel.is_cancelled());
        let removed = before - st.queue.len();
        st.skipped += removed as u64;
        if removed > 0 {
            self.shared.cv.notify_all();
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            queued: st.queue.len(),
            in_flight: st.in_flight,
            completed: st.completed,
            skipped: st.skipped,
        }
    }

    /// Block until no job is queued or running, or until `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while !st.queue.is_empty() || st.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = match self.shared.cv.wait_timeout(st, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Stop accepting work, drop queued jobs and join the workers.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        {
            let mut st = self.shared.lock();
            let dropped = st.queue.len();
            st.queue.clear();
            st.skipped += dropped as u64;
        }
        self.shared.cv.notify_all();

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter_mut() {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    log::error!("tile worker {} panicked", worker.id);
                }
            }
        }
        log::debug!("tile pool stopped");
    }
}

impl Drop for TilePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let entry = {
            let mut st = shared.lock();
            while st.queue.is_empty() && !shared.shutdown.load(AtomicOrdering::SeqCst) {
                st = shared.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
            if shared.shutdown.load(AtomicOrdering::SeqCst) {
                return;
            }
            let Some(entry) = st.queue.pop() else {
                continue;
            };
            if entry.cancel.is_cancelled() {
                st.skipped += 1;
                shared.cv.notify_all();
                continue;
            }
            st.in_flight += 1;
            entry
        };

        if catch_unwind(AssertUnwindSafe(entry.job)).is_err() {
            log::error!("tile job panicked (priority {})", entry.priority);
        }

        let mut st = shared.lock();
        st.in_flight -= 1;
        st.completed += 1;
        shared.cv.notify_all();
    }
}
