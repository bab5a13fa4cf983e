//! A bounded, single-producer/multi-consumer ring used to hand ready tasks
//! from the thread that queued them to whichever worker steals them next.
//!
//! The owning thread pushes at `tail` with a reserve-then-commit sequence
//! (bump the local cursor, write the slot, publish with a `Release` store);
//! any number of other threads race to steal from `head` with a CAS loop.
//! Items must be `Copy`: this ring is meant for the framework's non-owning
//! task handles ([`crate::task::RawTask`]), not for types whose destructor
//! would run twice if a losing stealer's speculative read weren't simply
//! discarded.
//!
//! Grounded on the reserve/commit two-stage protocol in
//! `ryanseipp-fern/fern-uring/src/ring_buffer/{producer,consumer}.rs`,
//! adapted from that crate's SPSC shape to SPMC (one producer, many
//! stealers racing a CAS on `head` instead of a single consumer owning it
//! outright).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use fern_core::Error;

use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Arc;

struct Inner<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: every slot is either empty, or written by the producer before its
// index is published via `tail`'s `Release` store, or claimed by exactly one
// stealer via a winning CAS on `head`.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// Build a ring and its producer/stealer handles. `capacity` is rounded up
/// to the next power of two.
pub fn ring<T: Copy>(capacity: usize) -> (Producer<T>, Stealer<T>) {
    let capacity = capacity.next_power_of_two().max(1);
    let buffer = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(Inner {
        buffer,
        mask: capacity - 1,
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Stealer { inner },
    )
}

/// The single handle allowed to push. Not `Clone`: there is exactly one
/// producer per ring, matching the "owning worker's queue" use.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy> Producer<T> {
    /// Push a task. Fails with [`Error::RingFull`] if every slot is still
    /// occupied by a task no stealer has taken yet.
    pub fn push(&self, item: T) -> Result<(), Error> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.inner.capacity {
            return Err(Error::RingFull);
        }
        let idx = tail & self.inner.mask;
        unsafe {
            (*self.inner.buffer[idx].get()).write(item);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Number of tasks currently queued (a snapshot; stealers may be racing
    /// to take them as this returns).
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Acquire);
        let head = self.inner.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A handle any number of worker threads can clone and race to steal from.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy> Stealer<T> {
    /// Take the oldest queued task, or `None` if the ring looked empty.
    pub fn steal(&self) -> Option<T> {
        loop {
            let head = self.inner.head.load(Ordering::Acquire);
            let tail = self.inner.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let idx = head & self.inner.mask;
            let candidate = unsafe { (*self.inner.buffer[idx].get()).assume_init_read() };
            match self.inner.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(candidate),
                Err(_) => continue, // lost the race; `candidate` is a bitwise duplicate of a
                                    // `Copy` value, not a second owner of anything, so dropping
                                    // it here is fine.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn push_then_steal_round_trips() {
        let (producer, stealer) = ring::<u32>(4);
        producer.push(10).unwrap();
        producer.push(20).unwrap();
        assert_eq!(stealer.steal(), Some(10));
        assert_eq!(stealer.steal(), Some(20));
        assert_eq!(stealer.steal(), None);
    }

    #[test]
    fn push_past_capacity_errors() {
        let (producer, _stealer) = ring::<u32>(2);
        producer.push(1).unwrap();
        producer.push(2).unwrap();
        assert!(matches!(producer.push(3), Err(Error::RingFull)));
    }

    #[test]
    fn concurrent_stealers_each_get_distinct_items() {
        let (producer, stealer) = ring::<u32>(64);
        for i in 0..60 {
            producer.push(i).unwrap();
        }
        let total = StdArc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stealer = stealer.clone();
            let total = total.clone();
            handles.push(thread::spawn(move || {
                let mut count = 0;
                while stealer.steal().is_some() {
                    count += 1;
                }
                total.fetch_add(count, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(std::sync::atomic::Ordering::SeqCst), 60);
    }
}

#[cfg(loom)]
mod loom_tests {
    use super::*;

    #[test]
    fn two_stealers_never_double_take() {
        loom::model(|| {
            let (producer, stealer) = ring::<u32>(2);
            producer.push(1).unwrap();
            producer.push(2).unwrap();
            let s2 = stealer.clone();
            let t1 = loom::thread::spawn(move || stealer.steal());
            let t2 = loom::thread::spawn(move || s2.steal());
            let r1 = t1.join().unwrap();
            let r2 = t2.join().unwrap();
            let mut got = vec![r1, r2].into_iter().flatten().collect::<Vec<_>>();
            got.sort_unstable();
            assert_eq!(got, vec![1, 2]);
        });
    }
}
