//! Hierarchical cancellation: stop sources, stop tokens, and scoped callbacks.
//!
//! A [`StopSource`] owns the cancellation flag for one scope. [`StopToken`]s
//! are cheap, `Clone`-able handles derived from a source (or from a parent
//! token, forming a tree) that let a sender register a callback to run the
//! moment cancellation is requested — including immediately inline, if it
//! already happened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Inner {
    cancelled: AtomicBool,
    parent: Option<StopToken>,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Inner {
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.parent {
            Some(p) => p.is_cancelled(),
            None => false,
        }
    }

    fn request_stop(self: &Arc<Self>) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
        for cb in callbacks {
            cb();
        }
        true
    }
}

/// Owns a cancellation scope. Dropping the source does not cancel it; call
/// [`StopSource::request_stop`] explicitly, the way a `scope_guard`'s early
/// cancel path would.
pub struct StopSource {
    inner: Arc<Inner>,
}

impl StopSource {
    /// A fresh, uncancelled, root stop source.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A stop source whose token is considered cancelled exactly when `parent`
    /// is, in addition to whatever `request_stop` does locally. Used to propagate
    /// an enclosing scope's cancellation into a nested `fork`/`let_value_each` scope.
    pub fn child_of(parent: &StopToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(parent.clone()),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Request cancellation. Idempotent: returns `true` the first time it
    /// actually transitions the flag, `false` on every call after.
    pub fn request_stop(&self) -> bool {
        self.inner.request_stop()
    }

    /// A token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            inner: self.inner.clone(),
        }
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheap, `Clone`-able handle to a [`StopSource`]'s cancellation state, or to
/// a "never cancels" state for contexts that don't need real cancellation.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<Inner>,
}

impl StopToken {
    /// A token that reports `is_cancelled() == false` forever and whose
    /// `on_stop` callbacks never run. Cheap to hand out when a sequence
    /// environment has no enclosing scope to cancel from.
    pub fn never() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Register `callback` to run the moment this token (or any ancestor) is
    /// cancelled. If it is already cancelled, `callback` runs inline before
    /// this call returns, matching `inplace_stop_callback`'s documented
    /// "fires synchronously if already stopped" behavior.
    pub fn on_stop<F: FnOnce() + Send + 'static>(&self, callback: F) {
        if self.is_cancelled() {
            callback();
            return;
        }
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// A token whose cancellation state mirrors `self`, for handing down into
    /// a child scope without granting it the ability to cancel the parent.
    pub fn child(&self) -> StopToken {
        self.clone()
    }
}

// SAFETY: `Inner` is only ever shared behind `Arc`, and all mutation goes
// through `AtomicBool`/`Mutex`.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}
