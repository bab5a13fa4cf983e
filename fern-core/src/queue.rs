//! A lock-free, intrusive-free MPSC queue built as a Treiber stack with a
//! reverse-on-drain step to restore FIFO order.
//!
//! Producers push with a single CAS loop; a single consumer drains the whole
//! backlog at once by swapping the head pointer to null and walking the
//! resulting LIFO chain in reverse. This is the shape used for the
//! cross-thread submission handoff into an io_uring context and for the
//! async mutex's pending-waiter list: many senders, one drainer, no lock.

use std::ptr;

use crate::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// A multi-producer, single-consumer queue. `push` is lock-free and safe to
/// call from any number of threads concurrently; `drain` must only be called
/// by whichever single thread currently owns consumption (the io_uring
/// context's own thread, or the mutex's current lock holder).
pub struct MpscQueue<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a value. Lock-free: a CAS loop racing other pushers, never a
    /// drainer (drainers only ever swap the head to null, never read `next`
    /// on a node still reachable from `head`).
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*node).next = head;
            }
            match self.head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Take every value pushed since the last drain, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut items = Vec::new();
        // `head` is a LIFO chain (most recent push first); collect then reverse.
        while !head.is_empty_ptr() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            items.push(node.value);
        }
        items.reverse();
        items
    }

    /// True if nothing is queued. Racy under concurrent `push`: a `false`
    /// observed here may go stale immediately, but a `true` observed here
    /// means the queue really was empty at that instant.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
        }
    }
}

trait PtrExt {
    fn is_empty_ptr(&self) -> bool;
}

impl<T> PtrExt for *mut Node<T> {
    fn is_empty_ptr(&self) -> bool {
        self.is_null()
    }
}

// SAFETY: `Node<T>` pointers only ever move between threads via the atomic
// head pointer; ownership transfers cleanly on each push/drain.
unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drain_preserves_push_order_single_threaded() {
        let q = MpscQueue::new();
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drain_empty_queue_yields_nothing() {
        let q: MpscQueue<u32> = MpscQueue::new();
        assert!(q.drain().is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_pushes_all_arrive() {
        let q = Arc::new(MpscQueue::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    q.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 1000);
    }
}

#[cfg(loom)]
mod loom_tests {
    use super::*;

    #[test]
    fn two_producers_one_drain() {
        loom::model(|| {
            let q = loom::sync::Arc::new(MpscQueue::new());
            let q1 = q.clone();
            let q2 = q.clone();
            let t1 = loom::thread::spawn(move || q1.push(1));
            let t2 = loom::thread::spawn(move || q2.push(2));
            t1.join().unwrap();
            t2.join().unwrap();
            let mut drained = q.drain();
            drained.sort_unstable();
            assert_eq!(drained, vec![1, 2]);
        });
    }
}
