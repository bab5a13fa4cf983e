//! Cross-thread submission handoff into an [`crate::context::IoUringContext`].
//!
//! Any thread may hand a [`crate::task::RawTask`] to a context it doesn't
//! own; the context's own thread is the only one that ever actually calls
//! `io_uring_enter`. `in_flight` is the handshake: foreign threads bump it
//! before queueing, the owning thread's drain decrements it by however many
//! it actually took. Once the context starts shutting down, `close` swings
//! the counter to the sentinel `-1`, after which every further `push` is
//! rejected — a plain `compare_exchange` on a count hitting zero can't
//! distinguish "empty, still open" from "empty, now closed", so the counter
//! needs a value outside the valid range to carry that third state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use fern_core::{Error, MpscQueue, Result};

use crate::notifier::EventFdNotifier;
use crate::task::{CorrelationIds, RawTask, SubmitItem};

const CLOSED: i64 = -1;

/// The shared queue a foreign thread pushes into and the owning context's
/// thread drains from.
pub struct SubmitQueue {
    queue: MpscQueue<SubmitItem>,
    in_flight: AtomicI64,
    notifier: Option<Arc<EventFdNotifier>>,
    correlation: CorrelationIds,
}

impl SubmitQueue {
    pub fn new(notifier: Option<Arc<EventFdNotifier>>) -> Self {
        Self {
            queue: MpscQueue::new(),
            in_flight: AtomicI64::new(0),
            notifier,
            correlation: CorrelationIds::new(),
        }
    }

    /// Assign `task` a correlation id and hand it to the owning context,
    /// returning the id so the caller can register a cancellation callback
    /// against it before the context has even drained the task — from any
    /// thread, since ids are minted here rather than at drain time.
    pub fn submit_task(&self, task: RawTask) -> Result<u64> {
        let id = self.correlation.next();
        self.push(SubmitItem::Task(id, task))?;
        Ok(id)
    }

    /// Queue a cancel request for a task previously assigned `correlation_id`.
    pub fn submit_cancel(&self, correlation_id: u64) -> Result<()> {
        self.push(SubmitItem::Cancel(correlation_id))
    }

    /// Hand an item to the owning context. Wakes the context's eventfd (if
    /// it has one) so a parked run loop notices promptly.
    pub fn push(&self, task: SubmitItem) -> Result<()> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == CLOSED {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map_err(|_| Error::InvalidContextState("submit queue is closed"))?;
        self.queue.push(task);
        if let Some(notifier) = &self.notifier {
            let _ = notifier.notify();
        }
        Ok(())
    }

    /// Take every item queued since the last drain, oldest first, and settle
    /// their share of `in_flight`.
    pub fn drain(&self) -> Vec<SubmitItem> {
        let items = self.queue.drain();
        if !items.is_empty() {
            self.in_flight.fetch_sub(items.len() as i64, Ordering::AcqRel);
        }
        items
    }

    /// Stop accepting new submissions. Idempotent. Already-queued tasks
    /// remain available to `drain`; callers should keep draining until both
    /// the queue and `in_flight` read as settled before tearing the context
    /// down the rest of the way.
    pub fn close(&self) {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current == CLOSED {
                return;
            }
            if self
                .in_flight
                .compare_exchange(current, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == CLOSED
    }

    /// Number of tasks accepted but not yet drained. Meaningless (reads as
    /// the `CLOSED` sentinel) once [`Self::close`] has run.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskVTable;
    use std::sync::atomic::AtomicUsize;

    static NOOP_VTABLE: TaskVTable = TaskVTable {
        prepare: |_| io_uring::opcode::Nop::new().build(),
        complete: |_, _, _| {},
        ready: |_| false,
    };

    fn noop_task() -> RawTask {
        unsafe { RawTask::new(std::ptr::null(), &NOOP_VTABLE) }
    }

    #[test]
    fn push_then_drain_settles_in_flight() {
        let q = SubmitQueue::new(None);
        q.submit_task(noop_task()).unwrap();
        q.submit_task(noop_task()).unwrap();
        assert_eq!(q.in_flight(), 2);
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn submit_task_returns_distinct_ids() {
        let q = SubmitQueue::new(None);
        let a = q.submit_task(noop_task()).unwrap();
        let b = q.submit_task(noop_task()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn close_rejects_further_pushes() {
        let q = SubmitQueue::new(None);
        q.submit_task(noop_task()).unwrap();
        q.close();
        assert!(q.is_closed());
        assert!(matches!(q.submit_task(noop_task()), Err(Error::InvalidContextState(_))));
    }

    #[test]
    fn concurrent_pushes_all_counted() {
        let q = Arc::new(SubmitQueue::new(None));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    if q.submit_task(noop_task()).is_ok() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.in_flight() as usize, counter.load(Ordering::SeqCst));
    }
}
