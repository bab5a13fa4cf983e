//! An async mutex built on the same lock-free MPSC drain-on-claim pattern as
//! the cross-thread submission queue, instead of the OS-thread-parking
//! critical section a plain `std::sync::Mutex` would force on callers.
//!
//! Acquiring the mutex never blocks a thread: `lock()` is a sender whose
//! receiver eventually gets a [`MutexGuard`]. Any number of threads may race
//! to acquire; exactly one at a time is ever "pumping" — claimed via a CAS on
//! `has_owner` — and that pumping thread is the only one that ever looks at
//! the staged waiter queue, so no further synchronization is needed there.
//!
//! Grounded on `examples/GssMahadevan-gvthread/crates/gvthread-core/src/mutex.rs`'s
//! `SchedMutex`, reworked from its OS-thread-yielding `lock_slow` loop into a
//! sender that hands off a guard directly to whichever waiter is next,
//! rather than parking a thread to poll for the lock becoming free.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fern_core::{Error, MpscQueue, Operation, Receiver, Sender};

type Continuation<T> = Box<dyn FnOnce(MutexGuard<T>) + Send>;

struct Inner<T> {
    has_owner: AtomicBool,
    data: UnsafeCell<T>,
    incoming: MpscQueue<Continuation<T>>,
    staging: UnsafeCell<VecDeque<Continuation<T>>>,
}

// SAFETY: `data` and `staging` are only ever touched by whichever thread
// currently holds `has_owner`, and `has_owner`'s CAS transitions make that
// access exclusive the same way a real lock's critical section would.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// An async mutex over `T`.
pub struct AsyncMutex<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                has_owner: AtomicBool::new(false),
                data: UnsafeCell::new(value),
                incoming: MpscQueue::new(),
                staging: UnsafeCell::new(VecDeque::new()),
            }),
        }
    }

    /// A sender completing with a [`MutexGuard`] once this caller reaches
    /// the front of the line.
    pub fn lock(&self) -> LockSender<T> {
        LockSender {
            inner: self.inner.clone(),
        }
    }

    /// Access the data directly; sound because `&mut self` already proves
    /// exclusive access, the same way `std::sync::Mutex::get_mut` works.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.inner.data.get() }
    }
}

fn pump<T: Send + 'static>(inner: Arc<Inner<T>>) {
    loop {
        let next = unsafe { (*inner.staging.get()).pop_front() };
        let next = match next {
            Some(c) => c,
            None => {
                let fresh: VecDeque<Continuation<T>> = inner.incoming.drain().into();
                if fresh.is_empty() {
                    inner.has_owner.store(false, Ordering::Release);
                    if inner.incoming.is_empty() {
                        return;
                    }
                    match inner.has_owner.compare_exchange(
                        false,
                        true,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
                let mut fresh = fresh;
                let first = fresh.pop_front().expect("checked non-empty above");
                unsafe {
                    *inner.staging.get() = fresh;
                }
                first
            }
        };
        let guard = MutexGuard {
            inner: inner.clone(),
        };
        next(guard);
        return;
    }
}

/// A sender produced by [`AsyncMutex::lock`].
pub struct LockSender<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Sender for LockSender<T> {
    type Value = MutexGuard<T>;
    type Error = Error;
    type Operation<R>
        = LockOperation<T, R>
    where
        R: Receiver<Value = MutexGuard<T>, Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = MutexGuard<T>, Error = Error>,
    {
        LockOperation {
            inner: self.inner,
            receiver: Some(receiver),
        }
    }
}

pub struct LockOperation<T, R> {
    inner: Arc<Inner<T>>,
    receiver: Option<R>,
}

impl<T, R> Operation for LockOperation<T, R>
where
    T: Send + 'static,
    R: Receiver<Value = MutexGuard<T>, Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let cont: Continuation<T> = Box::new(move |guard| receiver.set_value(guard));
        self.inner.incoming.push(cont);
        if self
            .inner
            .has_owner
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            pump(self.inner.clone());
        }
    }
}

/// Exclusive access to an [`AsyncMutex`]'s data. Hands off to the next
/// waiter (or releases the mutex) when dropped.
pub struct MutexGuard<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Deref for MutexGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.inner.data.get() }
    }
}

impl<T: Send + 'static> DerefMut for MutexGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.inner.data.get() }
    }
}

impl<T: Send + 'static> Drop for MutexGuard<T> {
    fn drop(&mut self) {
        pump(self.inner.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_core::sender::FnReceiver;
    use std::pin::pin;
    use std::sync::Arc as StdArc;
    use std::thread;

    fn lock_and<T, F>(mutex: &AsyncMutex<T>, f: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut MutexGuard<T>) + Send + 'static,
    {
        let receiver = FnReceiver {
            on_value: move |mut guard: MutexGuard<T>| f(&mut guard),
            on_error: |_: Error| panic!("mutex never errors"),
            on_stopped: || panic!("mutex lock unexpectedly stopped"),
        };
        let op = mutex.lock().connect(receiver);
        pin!(op).as_mut().start();
    }

    #[test]
    fn single_threaded_lock_runs_inline() {
        let mutex = AsyncMutex::new(0u32);
        lock_and(&mutex, |guard| **guard += 1);
        lock_and(&mutex, |guard| **guard += 1);
        let mut mutex = mutex;
        assert_eq!(*mutex.get_mut(), 2);
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let mutex = StdArc::new(AsyncMutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let (tx, rx) = std::sync::mpsc::channel();
                    let receiver = FnReceiver {
                        on_value: move |mut guard: MutexGuard<u64>| {
                            *guard += 1;
                            drop(guard);
                            tx.send(()).unwrap();
                        },
                        on_error: |_: Error| panic!("mutex never errors"),
                        on_stopped: || panic!("mutex lock unexpectedly stopped"),
                    };
                    let op = mutex.lock().connect(receiver);
                    pin!(op).as_mut().start();
                    rx.recv().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut mutex = StdArc::try_unwrap(mutex).unwrap_or_else(|_| panic!("dangling ref"));
        assert_eq!(*mutex.get_mut(), 4000);
    }
}
