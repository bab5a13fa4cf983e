//! Fire-and-forget operation submission.
//!
//! Most senders are connected by a caller that already owns somewhere to
//! park the resulting operation object until it completes. Some call sites
//! — a channel fanning a notification out to each subscriber, a background
//! cleanup task — have no such place: the sender is started and its result
//! discarded. [`spawn_detached`] gives the operation object a heap home and
//! frees it from exactly the completion callback that observes its result,
//! the same "the thing that finishes owns the cleanup" shape the io_uring
//! completion dispatch uses for its own task objects.

use std::alloc::Layout;
use std::pin::Pin;
use std::sync::Arc;

use crate::sender::{Operation, Receiver, Sender};

/// Somewhere [`spawn_detached_in`] can get a fixed-size block of memory for
/// a detached operation's holder, other than the global allocator. Lets a
/// pool that already exists for another purpose (I/O buffers, say) also
/// back the small, constant-size allocation every detach needs, instead of
/// going through `malloc` on every fire-and-forget spawn.
pub trait DetachAllocator: Send + Sync {
    /// Allocate a block matching `layout`. Implementations that cannot
    /// satisfy the request synchronously should fall back to the global
    /// allocator rather than block or fail outright.
    fn acquire(&self, layout: Layout) -> *mut u8;

    /// Free a block previously returned by `acquire` with the same `layout`.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator's `acquire` with the same layout.
    unsafe fn release(&self, ptr: *mut u8, layout: Layout);
}

enum Backing {
    Global,
    Custom(Arc<dyn DetachAllocator>),
}

struct Holder {
    // Keeps the type-erased operation alive until it completes; `None`
    // before `start`, `Some` for the operation's lifetime, freed by the
    // completion callback that reclaims this holder.
    op: Option<Pin<Box<dyn Operation>>>,
    backing: Backing,
}

/// Drop and free a `Holder` through whichever allocator produced it.
///
/// # Safety
/// `ptr` must point at a live, uniquely-owned `Holder` produced by
/// [`spawn_detached`] or [`spawn_detached_in`], not yet reclaimed.
unsafe fn reclaim_holder(ptr: *mut Holder) {
    match &(*ptr).backing {
        Backing::Global => drop(Box::from_raw(ptr)),
        Backing::Custom(allocator) => {
            let allocator = allocator.clone();
            std::ptr::drop_in_place(ptr);
            allocator.release(ptr as *mut u8, Layout::new::<Holder>());
        }
    }
}

/// The receiver [`spawn_detached`] actually connects to the sender. Public
/// only so generic callers (a `Resource`/`Token`-style trait whose concrete
/// sender type isn't known locally) can name `S::Operation<DetachReceiver<R>>`
/// in their own `where` clauses to satisfy the `'static` bound `spawn_detached`
/// needs to box the operation as `dyn Operation`.
pub struct DetachReceiver<R> {
    inner: R,
    holder: *mut Holder,
}

// SAFETY: the holder pointer is only ever dereferenced once, by whichever
// thread's completion callback runs it, and only to reclaim and drop it.
unsafe impl<R: Send> Send for DetachReceiver<R> {}

impl<R> DetachReceiver<R> {
    unsafe fn reclaim(&self) {
        reclaim_holder(self.holder);
    }
}

impl<R> Receiver for DetachReceiver<R>
where
    R: Receiver,
{
    type Value = R::Value;
    type Error = R::Error;

    fn set_value(self, value: Self::Value) {
        unsafe { self.reclaim() };
        self.inner.set_value(value);
    }

    fn set_error(self, error: Self::Error) {
        unsafe { self.reclaim() };
        self.inner.set_error(error);
    }

    fn set_stopped(self) {
        unsafe { self.reclaim() };
        self.inner.set_stopped();
    }
}

/// Bundles the `'static` bound [`spawn_detached`] needs on a sender's
/// operation once wrapped in a [`DetachReceiver<C>`], so a generic caller
/// (a combinator whose sender type is itself an abstract associated type,
/// like `SequenceReceiver::NextSender`) can write one bound —
/// `S: DetachableInto<MyReceiver>` — instead of projecting through
/// `<S as Sender>::Operation<DetachReceiver<MyReceiver>>: 'static` by hand at
/// every call site.
pub trait DetachableInto<C>: Sender
where
    C: Receiver<Value = Self::Value, Error = Self::Error> + Send + 'static,
{
}

impl<S, C> DetachableInto<C> for S
where
    S: Sender,
    C: Receiver<Value = S::Value, Error = S::Error> + Send + 'static,
    S::Operation<DetachReceiver<C>>: 'static,
{
}

/// Connect `sender` to `receiver`, start it, and let the operation object
/// free itself when it completes. The caller never sees the operation
/// object and cannot cancel it directly; cancellation (if any) must be
/// routed through a stop token the sender itself observes.
pub fn spawn_detached<S, R>(sender: S, receiver: R)
where
    S: DetachableInto<R>,
    R: Receiver<Value = S::Value, Error = S::Error> + Send + 'static,
{
    let holder_ptr = Box::into_raw(Box::new(Holder {
        op: None,
        backing: Backing::Global,
    }));
    start_detached(holder_ptr, sender, receiver);
}

/// Like [`spawn_detached`], but the holder is allocated through `allocator`
/// instead of the global allocator. Useful for call sites that spawn many
/// short-lived detached operations and already have a pool around for
/// something else (a fork/zip/merge combinator routing through the same
/// buffer pool its I/O uses, say).
pub fn spawn_detached_in<A, S, R>(allocator: Arc<A>, sender: S, receiver: R)
where
    A: DetachAllocator + 'static,
    S: DetachableInto<R>,
    R: Receiver<Value = S::Value, Error = S::Error> + Send + 'static,
{
    let layout = Layout::new::<Holder>();
    let raw = allocator.acquire(layout);
    assert!(!raw.is_null(), "DetachAllocator::acquire returned null");
    let holder_ptr = raw as *mut Holder;
    // SAFETY: `raw` is a fresh, uniquely-owned block sized for `Holder`.
    unsafe {
        holder_ptr.write(Holder {
            op: None,
            backing: Backing::Custom(allocator as Arc<dyn DetachAllocator>),
        });
    }
    start_detached(holder_ptr, sender, receiver);
}

fn start_detached<S, R>(holder_ptr: *mut Holder, sender: S, receiver: R)
where
    S: DetachableInto<R>,
    R: Receiver<Value = S::Value, Error = S::Error> + Send + 'static,
{
    let wrapped = DetachReceiver {
        inner: receiver,
        holder: holder_ptr,
    };
    let op: Pin<Box<dyn Operation>> = Box::pin(sender.connect(wrapped));
    // SAFETY: `holder_ptr` is valid and uniquely owned until a completion
    // callback reclaims it; nothing else reads or writes it in between.
    unsafe {
        (*holder_ptr).op = Some(op);
        (*holder_ptr)
            .op
            .as_mut()
            .expect("just assigned")
            .as_mut()
            .start();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{FnReceiver, JustSender};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    #[test]
    fn detached_just_sender_delivers_value() {
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: i32| *observed2.borrow_mut() = Some(v),
            on_error: |_: ()| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        spawn_detached(JustSender::<i32, ()>::new(7), receiver);
        assert_eq!(*observed.borrow(), Some(7));
    }

    #[test]
    fn detached_does_not_leak_the_holder() {
        // Run several times under miri/valgrind-style scrutiny would catch a
        // leaked or double-freed Holder; here we just confirm the value
        // still arrives after many detached spawns share no state.
        let observed = Arc::new(Mutex::new(Vec::new()));
        for i in 0..64 {
            let observed = observed.clone();
            let receiver = FnReceiver {
                on_value: move |v: i32| observed.lock().unwrap().push(v),
                on_error: |_: ()| panic!("unexpected error"),
                on_stopped: || panic!("unexpected stop"),
            };
            spawn_detached(JustSender::<i32, ()>::new(i), receiver);
        }
        assert_eq!(observed.lock().unwrap().len(), 64);
    }
}
