//! The io_uring execution context: owns the ring, drains its own submission
//! backlog every iteration, and dispatches completions back to whichever
//! task submitted the request.
//!
//! The run loop's shape — drain the cross-thread submission handoff, push
//! every pending SQE, kick the kernel, drain completions, dispatch them,
//! idle-sleep if nothing happened — is grounded on
//! `examples/GssMahadevan-gvthread/crates/ksvc-executor/src/lib.rs`'s
//! `dispatcher_loop`, adapted from that file's shared-memory kernel-module
//! ring into a context draining its own process-local io_uring instance.
//! Opening the ring itself is grounded on
//! `examples/GssMahadevan-gvthread/crates/ksvc-module/src/basic_iouring.rs`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fern_core::{Error, Operation, Receiver, Result, Sender, StopToken};
use io_uring::IoUring;

use crate::config::{Config, PoolConfig};
use crate::notifier::EventFdNotifier;
use crate::ops;
use crate::pool::{WorkerPool, WorkerPoolHandle};
use crate::submit_queue::SubmitQueue;
use crate::task::{RawTask, SubmitItem, NOTIFIER_CORRELATION};

/// A cheap, `Clone`-able, `Send + Sync` handle to a running
/// [`IoUringContext`]. This is what operation objects and the sequence
/// combinators actually hold onto; the context itself stays pinned to its
/// owning thread inside [`IoUringContext::run`].
#[derive(Clone)]
pub struct Handle {
    submit_queue: Arc<SubmitQueue>,
    worker_pool: WorkerPoolHandle,
}

impl Handle {
    /// Hand a task to the context for submission, returning the correlation
    /// id it was assigned. Safe to call from any thread, including the
    /// context's own; the id is minted by the shared [`SubmitQueue`] itself,
    /// so it's available immediately — before the context's own thread has
    /// even drained the task — for a caller that wants to register a
    /// cancellation callback against it right away.
    pub fn submit(&self, task: RawTask) -> Result<u64> {
        self.submit_queue.submit_task(task)
    }

    /// Request cancellation of whatever request is tagged with `correlation_id`.
    pub fn cancel(&self, correlation_id: u64) -> Result<()> {
        self.submit_queue.submit_cancel(correlation_id)
    }

    /// Queue a blocking call on the context's worker pool instead of
    /// submitting it to io_uring — used for syscalls with no io_uring
    /// opcode, like `getaddrinfo`-based DNS resolution.
    pub fn run_blocking<F>(&self, work: F) -> std::result::Result<(), crate::pool::WorkItem>
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker_pool.submit(Box::new(work))
    }

    /// A sender that completes on this context's own thread: if already
    /// running there, inline; otherwise marshaled through the submission
    /// queue as a zero-cost `IORING_OP_NOP`. Grounds `execution::schedule`.
    pub fn schedule(&self) -> ScheduleSender {
        ScheduleSender {
            handle: self.clone(),
        }
    }
}

/// A sender produced by [`Handle::schedule`]; completing it means "you are
/// now running on the context's thread".
pub struct ScheduleSender {
    handle: Handle,
}

impl Sender for ScheduleSender {
    type Value = ();
    type Error = Error;
    type Operation<R>
        = ScheduleOperation<R>
    where
        R: Receiver<Value = (), Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = (), Error = Error>,
    {
        ScheduleOperation {
            handle: self.handle,
            receiver: Some(receiver),
        }
    }
}

pub struct ScheduleOperation<R> {
    handle: Handle,
    receiver: Option<R>,
}

unsafe fn schedule_prepare<R>(_data: *const ()) -> io_uring::squeue::Entry {
    unreachable!("schedule tasks are always ready; prepare is never called")
}

unsafe fn schedule_ready<R>(_data: *const ()) -> bool {
    true
}

unsafe fn schedule_complete<R>(data: *const (), res: i32, _flags: u32)
where
    R: Receiver<Value = (), Error = Error>,
{
    let mut boxed = Box::from_raw(data as *mut Option<R>);
    if let Some(receiver) = boxed.take() {
        if res < 0 {
            receiver.set_error(Error::from_cqe_res(res));
        } else {
            receiver.set_value(());
        }
    }
}

/// A schedule task is always `ready`: its only job is "run on the context's
/// own thread", which is exactly where the drain loop that checks `ready`
/// already runs. That means it never needs an SQE or a kernel round trip —
/// it completes the instant the context's thread drains it from the
/// submission queue.
impl<R> Operation for ScheduleOperation<R>
where
    R: Receiver<Value = (), Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let leaked: *mut Option<R> = Box::into_raw(Box::new(Some(receiver)));

        let vtable = per_receiver_vtable::<R>();
        let raw = unsafe { RawTask::new(leaked as *const (), vtable) };
        if self.handle.submit(raw).is_err() {
            let mut boxed = unsafe { Box::from_raw(leaked) };
            if let Some(receiver) = boxed.take() {
                receiver.set_stopped();
            }
        }
    }
}

fn per_receiver_vtable<R>() -> &'static crate::task::TaskVTable
where
    R: Receiver<Value = (), Error = Error> + Send + 'static,
{
    static VTABLE: std::sync::OnceLock<crate::task::TaskVTable> = std::sync::OnceLock::new();
    VTABLE.get_or_init(|| crate::task::TaskVTable {
        ready: schedule_ready::<R>,
        prepare: schedule_prepare::<R>,
        complete: schedule_complete::<R>,
    })
}

/// The io_uring runtime. Owns the ring and the worker pool; its [`run`]
/// method must be called from the thread that is to issue every submission
/// (`single_issuer`, matching the `Config` default).
pub struct IoUringContext {
    ring: IoUring,
    pending: HashMap<u64, RawTask>,
    submit_queue: Arc<SubmitQueue>,
    notifier: Arc<EventFdNotifier>,
    notifier_armed: bool,
    worker_pool: WorkerPool,
    config: Config,
    stopping: AtomicBool,
    is_running: AtomicBool,
}

impl IoUringContext {
    pub fn new(config: Config, pool_config: PoolConfig) -> Result<Self> {
        let mut builder = IoUring::builder();
        if config.single_issuer {
            builder.setup_single_issuer();
        }
        if config.cooperative_taskrun {
            builder.setup_coop_taskrun();
        }
        if let Some(cq_entries) = config.cq_entries {
            builder.setup_cqsize(cq_entries);
        }
        let ring = builder.build(config.sq_entries).map_err(Error::from)?;

        let notifier = Arc::new(EventFdNotifier::create()?);
        let worker_pool = WorkerPool::new(
            pool_config.resolved_num_workers(),
            pool_config.queue_depth,
            Some(notifier.clone()),
        );
        let submit_queue = Arc::new(SubmitQueue::new(Some(notifier.clone())));

        Ok(Self {
            ring,
            pending: HashMap::new(),
            submit_queue,
            notifier,
            notifier_armed: false,
            worker_pool,
            config,
            stopping: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
        })
    }

    /// A cheap handle other threads (or this one, before/while `run` is
    /// executing) use to submit work and schedule onto this context.
    pub fn handle(&self) -> Handle {
        Handle {
            submit_queue: self.submit_queue.clone(),
            worker_pool: self.worker_pool.handle(),
        }
    }

    /// Ask the run loop to stop once its current batch of completions is
    /// dispatched and the submission queue is closed and drained.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.submit_queue.close();
    }

    /// Clear shutdown state so the context can be [`Self::run`] again.
    /// Returns [`Error::InvalidContextState`] if called while `run` is still
    /// executing on another thread, or while tasks are still outstanding —
    /// resetting out from under live work would orphan their completions.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::Acquire) {
            return Err(Error::InvalidContextState("cannot reset a context while it is running"));
        }
        if !self.pending.is_empty() || self.submit_queue.in_flight() > 0 {
            return Err(Error::InvalidContextState("cannot reset a context with outstanding work"));
        }
        self.stopping.store(false, Ordering::Release);
        self.notifier_armed = false;
        Ok(())
    }

    /// Run until [`Self::request_stop`] is called (from another thread, or
    /// from a task's completion callback) and the outstanding work settles.
    /// Must be called from a single thread for this context's whole
    /// lifetime; returns [`Error::InvalidContextState`] if called while
    /// already running (from a re-entrant call, or a second thread).
    pub fn run(&mut self, stop_token: &StopToken) -> Result<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidContextState("context is already running"));
        }
        let result = self.run_until_stopped(stop_token);
        self.is_running.store(false, Ordering::Release);
        result
    }

    fn run_until_stopped(&mut self, stop_token: &StopToken) -> Result<()> {
        loop {
            let stop_requested = self.stopping.load(Ordering::Acquire) || stop_token.is_cancelled();
            if stop_requested {
                self.submit_queue.close();
            }

            let drained = self.drain_submit_queue();
            let had_work = drained > 0;
            let had_completions = self.drain_completions(false)?;

            if stop_requested && self.pending.is_empty() && self.submit_queue.in_flight() <= 0 {
                return Ok(());
            }

            if !had_work && !had_completions {
                // Nothing to do right now: block in `io_uring_enter` instead
                // of busy-polling. A completion on an in-flight task wakes us
                // directly; a cross-thread submission wakes us through the
                // notifier poll armed below, which `drain_completions`
                // re-arms each time it fires.
                self.arm_notifier_poll();
                self.drain_completions(true)?;
            }
        }
    }

    /// Arm a one-shot poll on the notifier eventfd, if one isn't already in
    /// flight, so a blocking wait also wakes on cross-thread submissions.
    fn arm_notifier_poll(&mut self) {
        if self.notifier_armed {
            return;
        }
        let entry = ops::poll_add_readable(self.notifier.as_raw_fd()).user_data(NOTIFIER_CORRELATION);
        if unsafe { self.ring.submission().push(&entry) }.is_ok() {
            self.notifier_armed = true;
            let _ = self.ring.submit();
        }
    }

    /// Drain the cross-thread submission backlog, dispatching any task whose
    /// vtable reports it already `ready` straight away, and otherwise
    /// building and pushing an SQE for it; also submits an
    /// `IORING_OP_ASYNC_CANCEL` for each cancel request. Returns the number
    /// of items drained.
    fn drain_submit_queue(&mut self) -> usize {
        let items = self.submit_queue.drain();
        let count = items.len();
        for item in items {
            match item {
                SubmitItem::Task(id, task) => {
                    if unsafe { task.is_ready() } {
                        unsafe { task.complete(0, 0) };
                        continue;
                    }
                    let entry = unsafe { task.prepare() }.user_data(id);
                    self.pending.insert(id, task);
                    if unsafe { self.ring.submission().push(&entry) }.is_err() {
                        tracing::warn!("submission queue full, dropping a ready task");
                        if let Some(task) = self.pending.remove(&id) {
                            unsafe { task.complete(-libc::ENOSPC, 0) };
                        }
                    }
                }
                SubmitItem::Cancel(target_id) => {
                    let entry = ops::async_cancel(target_id).user_data(crate::task::NO_CORRELATION);
                    let _ = unsafe { self.ring.submission().push(&entry) };
                }
            }
        }
        if count > 0 {
            let _ = self.ring.submit();
        }
        count
    }

    /// Drain whatever completions are queued and dispatch each to its task.
    /// If `block` is true and nothing is queued yet, blocks in
    /// `io_uring_enter` for at least one completion. Returns `true` if
    /// anything was dispatched.
    fn drain_completions(&mut self, block: bool) -> Result<bool> {
        self.notifier.drain();
        if block {
            self.ring.submit_and_wait(1).map_err(Error::from)?;
        } else {
            let _ = self.ring.submit();
        }
        let max_batch = self.config.max_batch;
        let mut dispatched = false;
        let mut completion = self.ring.completion();
        completion.sync();
        for cqe in completion.by_ref().take(max_batch) {
            dispatched = true;
            let user_data = cqe.user_data();
            if user_data == NOTIFIER_CORRELATION {
                self.notifier_armed = false;
                continue;
            }
            if user_data == crate::task::NO_CORRELATION {
                continue;
            }
            if let Some(task) = self.pending.remove(&user_data) {
                unsafe { task.complete(cqe.result(), cqe.flags()) };
            }
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_construct_without_single_issuer_panic() {
        // Constructing a real IoUringContext requires a live kernel with
        // io_uring support; exercised by the integration tests under
        // `tests/`, which skip gracefully on kernels too old to support it.
        let config = Config::default();
        assert!(config.sq_entries > 0);
    }
}
