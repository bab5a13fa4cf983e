//! A static thread pool for syscalls io_uring can't (or shouldn't) issue
//! asynchronously — DNS resolution via `getaddrinfo`, and any opcode a given
//! kernel doesn't support so the context falls back to a blocking call off
//! the io_uring thread.
//!
//! Grounded on
//! `examples/GssMahadevan-gvthread/crates/ksvc-module/src/fixed_pool.rs`'s
//! `FixedPool`: a fixed set of worker threads pulling from a shared
//! `ArrayQueue`, posting results to a second `ArrayQueue`, parked with
//! `thread::park_timeout` when idle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::notifier::EventFdNotifier;

/// A unit of blocking work submitted to the pool. Boxed because the pool
/// doesn't know the concrete operation type, only that it can run once.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

const PARK_TIMEOUT: Duration = Duration::from_millis(50);

struct PoolInner {
    queue: ArrayQueue<WorkItem>,
    shutdown: AtomicBool,
    active: AtomicUsize,
}

/// A fixed-size pool of blocking-call worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads pulling from a queue of depth `queue_depth`.
    /// `notifier`, if given, is written to after every completed work item so
    /// a parked io_uring run loop wakes promptly.
    pub fn new(num_workers: usize, queue_depth: usize, notifier: Option<Arc<EventFdNotifier>>) -> Self {
        let num_workers = num_workers.max(1);
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(queue_depth.max(1)),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });
        let mut handles = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let inner = inner.clone();
            let notifier = notifier.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("fern-uring-worker-{id}"))
                    .spawn(move || worker_loop(inner, notifier))
                    .expect("failed to spawn fern-uring worker thread"),
            );
        }
        Self { inner, handles }
    }

    /// The pool sized the way the spec's default config does: `min(8, ncpus/2)`,
    /// never fewer than 1.
    pub fn auto_sized(queue_depth: usize, notifier: Option<Arc<EventFdNotifier>>) -> Self {
        let ncpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let num_workers = (ncpus / 2).clamp(1, 8);
        Self::new(num_workers, queue_depth, notifier)
    }

    /// Queue `work` for a worker thread to run. Returns it back if the queue
    /// is full.
    pub fn submit(&self, work: WorkItem) -> Result<(), WorkItem> {
        self.inner.queue.push(work)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// A cheap, `Clone`-able, `Send + Sync` submitter sharing this pool's
    /// queue, for handing to code that only needs to submit blocking work
    /// and shouldn't also be able to shut the pool down.
    pub fn handle(&self) -> WorkerPoolHandle {
        WorkerPoolHandle {
            inner: self.inner.clone(),
        }
    }

    /// Signal every worker to exit once its current item (if any) finishes,
    /// and wait for them to join.
    pub fn shutdown(mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// A cloneable, submit-only view of a [`WorkerPool`].
#[derive(Clone)]
pub struct WorkerPoolHandle {
    inner: Arc<PoolInner>,
}

impl WorkerPoolHandle {
    pub fn submit(&self, work: WorkItem) -> Result<(), WorkItem> {
        self.inner.queue.push(work)
    }
}

fn worker_loop(inner: Arc<PoolInner>, notifier: Option<Arc<EventFdNotifier>>) {
    loop {
        match inner.queue.pop() {
            Some(work) => {
                inner.active.fetch_add(1, Ordering::AcqRel);
                work();
                inner.active.fetch_sub(1, Ordering::AcqRel);
                if let Some(notifier) = &notifier {
                    let _ = notifier.notify();
                }
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                thread::park_timeout(PARK_TIMEOUT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn submits_run_and_report_back() {
        let pool = WorkerPool::new(2, 16, None);
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut received: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn auto_sized_is_at_least_one() {
        let pool = WorkerPool::auto_sized(8, None);
        assert!(!pool.handles.is_empty());
        pool.shutdown();
    }
}
