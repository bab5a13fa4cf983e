//! The task vtable: an allocation-free way for an `IoUringContext` to call
//! back into an arbitrary operation object once its submission completes.
//!
//! Operation objects embed a [`TaskHeader`] inline (the way `std::task`
//! embeds a `RawWaker` inside whatever owns a `Waker`). The context never
//! owns or allocates the task; it only ever holds a type-erased pointer plus
//! a vtable, correlated back to the waiting operation through the `user_data`
//! field of the submitted SQE/CQE pair.

use std::sync::atomic::{AtomicU64, Ordering};

/// Function pointers an operation object provides so the context can drive
/// it without knowing its concrete type.
pub struct TaskVTable {
    /// Build the SQE to submit for this task. Returned by value, the way
    /// every `io_uring::opcode::*::build()` call already does, and tagged
    /// with its correlation id by the caller afterward. Never called if
    /// `ready` reports the task as already resolvable.
    pub prepare: unsafe fn(data: *const ()) -> io_uring::squeue::Entry,
    /// Called once with the CQE's `res` and `flags` once the kernel (or the
    /// cancellation path) completes this task's request.
    pub complete: unsafe fn(data: *const (), res: i32, flags: u32),
    /// Whether this task can be completed the moment it's drained from the
    /// submission queue, with no SQE or kernel round trip at all — true for
    /// a `schedule()` task, whose only job is "run on the context's own
    /// thread", which is exactly where the drain happens. Checked before
    /// `prepare`; when it returns `true`, `complete` is called directly with
    /// `res = 0, flags = 0` instead.
    pub ready: unsafe fn(data: *const ()) -> bool,
}

/// A type-erased handle to an in-flight task, analogous to `RawWaker`.
#[derive(Clone, Copy)]
pub struct RawTask {
    data: *const (),
    vtable: &'static TaskVTable,
}

impl RawTask {
    /// # Safety
    /// `data` must remain valid, and `vtable`'s function pointers must be
    /// safe to call with `data`, for as long as this `RawTask` might be
    /// submitted or completed — i.e. until `complete` has been called.
    pub unsafe fn new(data: *const (), vtable: &'static TaskVTable) -> Self {
        Self { data, vtable }
    }

    /// # Safety
    /// Must only be called by the context that owns submission, before
    /// `prepare` or `complete`.
    pub unsafe fn is_ready(&self) -> bool {
        (self.vtable.ready)(self.data)
    }

    /// # Safety
    /// Must only be called by the context that owns submission, exactly
    /// once per submitted entry, and only if `is_ready` returned `false`.
    pub unsafe fn prepare(&self) -> io_uring::squeue::Entry {
        (self.vtable.prepare)(self.data)
    }

    /// # Safety
    /// Must only be called once, with the `res`/`flags` of the CQE this
    /// task's `user_data` correlates to.
    pub unsafe fn complete(&self, res: i32, flags: u32) {
        (self.vtable.complete)(self.data, res, flags)
    }
}

// SAFETY: the operation object behind `data` is itself required to be
// `Send`; `RawTask` is just a non-owning view over it, same contract as
// `std::task::RawWaker`.
unsafe impl Send for RawTask {}

/// What the cross-thread submission queue actually carries: either a real
/// task already tagged with the correlation id its completion will carry, or
/// a fire-and-forget request to cancel one already in flight by that id.
#[derive(Clone, Copy)]
pub enum SubmitItem {
    Task(u64, RawTask),
    Cancel(u64),
}

/// Issues the `user_data` tag each submitted SQE carries so its completion
/// can be correlated back to a [`RawTask`] once the matching CQE arrives.
///
/// Owned by [`crate::submit_queue::SubmitQueue`] rather than by the context
/// itself: a task needs its id the moment it's handed to `SubmitQueue::push`,
/// from whatever foreign thread that is, not only once the context's own
/// thread gets around to draining it — that's what lets a caller register a
/// cancellation callback against the id synchronously, before the context
/// has even seen the task.
///
/// The context keeps a side table (see `fern_uring::context`) mapping these
/// tags to `RawTask`s; the tag itself carries no pointer so it stays valid
/// even if the allocation backing the side table resizes.
pub struct CorrelationIds {
    next: AtomicU64,
}

/// Sentinel `user_data` value meaning "no correlation needed", used for
/// fire-and-forget `IORING_OP_ASYNC_CANCEL` submissions.
pub const NO_CORRELATION: u64 = u64::MAX;

/// Sentinel `user_data` tagging the context's own re-armable notifier poll,
/// distinct from [`NO_CORRELATION`] so the run loop can tell "a cancel ack
/// landed" apart from "the eventfd fired, re-arm the poll" without a pending
/// table lookup.
pub const NOTIFIER_CORRELATION: u64 = u64::MAX - 1;

impl CorrelationIds {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != NO_CORRELATION && id != NOTIFIER_CORRELATION {
                return id;
            }
        }
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_increase_and_skip_sentinel() {
        let ids = CorrelationIds::new();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert_ne!(a, NO_CORRELATION);
        assert_ne!(b, NO_CORRELATION);
    }
}
