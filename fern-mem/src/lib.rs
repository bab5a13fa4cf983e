//! A power-of-two bucketed memory pool.
//!
//! Allocations are rounded up to the nearest bucket size (`64B, 128B, 256B,
//! ... `) and served from a per-bucket free-list. A bucket can optionally cap
//! how many blocks it will ever hand out; once capped and exhausted, further
//! allocation requests park until a block of that size is freed, at which
//! point the freed block is handed directly to the oldest waiter rather than
//! going back through the free-list. Buckets with no cap fall back to the
//! upstream allocator whenever their free-list is empty; if the upstream
//! allocator genuinely fails (not just "capacity reached"), the request
//! completes with [`Error::AllocationFailed`] rather than parking forever
//! waiting for a block nobody will free.
//!
//! Grounded in the same "reuse freed slots before minting new ones" shape as
//! a LIFO free-list slot allocator, generalized from one fixed slot size to
//! 32 power-of-two buckets with an explicit parked-waiter handoff.

use std::alloc::Layout;
use std::collections::VecDeque;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fern_core::{
    ConstBuffer, DetachAllocator, Error, MutableBuffer, Operation, Receiver, Result, Sender,
    StopToken,
};

/// The largest number of distinct bucket sizes a pool may have.
pub const MAX_BUCKETS: u32 = 32;

const BLOCK_ALIGN: usize = 16;

/// Where a pool's buckets get fresh memory from when their free-list is
/// empty. Pluggable so tests (or an embedder with its own arena) can swap in
/// something other than the system allocator, and so genuine allocator
/// failure can be distinguished from "bucket capacity reached" in tests.
pub trait Upstream: Send + Sync {
    /// Allocate a block matching `layout`, or `None` on genuine failure.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Free a block previously returned by `alloc` with the same `layout`.
    ///
    /// # Safety
    /// `ptr` must have come from this `Upstream`'s `alloc` with the same layout.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default [`Upstream`]: the process's global allocator.
pub struct SystemUpstream;

impl Upstream for SystemUpstream {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Configuration for a [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// `log2` of the smallest bucket's block size.
    pub min_bucket_shift: u32,
    /// `log2` of the largest bucket's block size.
    pub max_bucket_shift: u32,
    /// Maximum blocks a bucket will hold outstanding at once before
    /// allocation requests park. `None` means a bucket falls back to the
    /// upstream allocator indefinitely and only parks on genuine upstream
    /// failure (which then surfaces as an error instead, since nothing will
    /// ever free a block to wake it).
    pub capacity_per_bucket: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_bucket_shift: 6,  // 64 B
            max_bucket_shift: 21, // 2 MiB
            capacity_per_bucket: Some(256),
        }
    }
}

impl PoolConfig {
    fn bucket_count(&self) -> u32 {
        self.max_bucket_shift - self.min_bucket_shift + 1
    }
}

enum ParkOutcome {
    Value(PoolBuffer),
    Error(Error),
    Stopped,
}

struct ParkedWaiter {
    id: u64,
    cont: Box<dyn FnOnce(ParkOutcome) + Send>,
}

struct BucketInfo {
    block_size: usize,
    capacity: Option<usize>,
    outstanding: AtomicUsize,
}

impl BucketInfo {
    fn layout(&self) -> Layout {
        Layout::from_size_align(self.block_size, BLOCK_ALIGN).expect("bucket layout")
    }
}

/// Free-lists and parked waiters for every bucket, behind one lock. A single
/// pool tends to be touched by many small, short critical sections (pop a
/// free block, push a waiter); one mutex keeps that simple instead of
/// juggling 32 independent locks for no real concurrency benefit at this
/// scale.
struct PoolState {
    free_lists: Vec<Vec<NonNull<u8>>>,
    waiters: Vec<VecDeque<ParkedWaiter>>,
}

// SAFETY: all pointers in `free_lists` are unique, heap-allocated blocks
// never aliased while queued; access is serialized by `PoolInner::state`.
unsafe impl Send for PoolState {}

struct PoolInner {
    buckets: Vec<BucketInfo>,
    min_shift: u32,
    state: Mutex<PoolState>,
    upstream: Box<dyn Upstream>,
    next_waiter_id: AtomicU64,
}

enum TakeOutcome {
    Got(NonNull<u8>),
    Park,
    Failed,
}

impl PoolInner {
    fn bucket_index_for(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Ok(0);
        }
        let shift = usize::BITS - (size - 1).leading_zeros().min(usize::BITS - 1);
        let shift = shift.max(self.min_shift);
        if shift as usize - self.min_shift as usize >= self.buckets.len() {
            return Err(Error::InvalidArgument("requested size exceeds the largest pool bucket"));
        }
        Ok(shift as usize - self.min_shift as usize)
    }

    fn try_take(&self, bucket_idx: usize) -> TakeOutcome {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(ptr) = state.free_lists[bucket_idx].pop() {
                return TakeOutcome::Got(ptr);
            }
        }
        let bucket = &self.buckets[bucket_idx];
        let allowed = match bucket.capacity {
            None => true,
            Some(cap) => bucket
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    if n < cap {
                        Some(n + 1)
                    } else {
                        None
                    }
                })
                .is_ok(),
        };
        if !allowed {
            return TakeOutcome::Park;
        }
        match self.upstream.alloc(bucket.layout()) {
            Some(ptr) => TakeOutcome::Got(ptr),
            None => {
                if bucket.capacity.is_some() {
                    bucket.outstanding.fetch_sub(1, Ordering::AcqRel);
                }
                TakeOutcome::Failed
            }
        }
    }

    fn release(self: &Arc<Self>, bucket_idx: usize, ptr: NonNull<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(waiter) = state.waiters[bucket_idx].pop_front() {
            drop(state);
            let bucket = &self.buckets[bucket_idx];
            let buf = PoolBuffer {
                ptr,
                requested_len: bucket.block_size,
                block_size: bucket.block_size,
                bucket: bucket_idx,
                pool: Arc::downgrade(self),
            };
            (waiter.cont)(ParkOutcome::Value(buf));
        } else {
            state.free_lists[bucket_idx].push(ptr);
        }
    }

    fn park(&self, bucket_idx: usize, id: u64, cont: Box<dyn FnOnce(ParkOutcome) + Send>) {
        self.state.lock().unwrap().waiters[bucket_idx].push_back(ParkedWaiter { id, cont });
    }

    /// Remove a parked waiter by id, if it hasn't already been woken, and
    /// deliver it a `Stopped` outcome. No-op if the waiter already completed.
    fn cancel_parked(&self, bucket_idx: usize, id: u64) {
        let cont = {
            let mut state = self.state.lock().unwrap();
            let queue = &mut state.waiters[bucket_idx];
            let pos = queue.iter().position(|w| w.id == id);
            pos.map(|pos| queue.remove(pos).unwrap().cont)
        };
        if let Some(cont) = cont {
            cont(ParkOutcome::Stopped);
        }
    }

    fn next_waiter_id(&self) -> u64 {
        self.next_waiter_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        for (bucket, free_list) in self.buckets.iter().zip(state.free_lists.iter_mut()) {
            let layout = bucket.layout();
            for ptr in free_list.drain(..) {
                unsafe { self.upstream.dealloc(ptr, layout) };
            }
        }
    }
}

/// A bucketed memory pool. Cheap to `Clone`: internally an `Arc`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_upstream(config, SystemUpstream)
    }

    /// Build a pool whose buckets are refilled by `upstream` instead of the
    /// system allocator.
    pub fn with_upstream(config: PoolConfig, upstream: impl Upstream + 'static) -> Self {
        assert!(
            config.bucket_count() <= MAX_BUCKETS,
            "pool configured with more than {MAX_BUCKETS} buckets"
        );
        let buckets: Vec<BucketInfo> = (0..config.bucket_count())
            .map(|i| BucketInfo {
                block_size: 1usize << (config.min_bucket_shift + i),
                capacity: config.capacity_per_bucket,
                outstanding: AtomicUsize::new(0),
            })
            .collect();
        let bucket_count = buckets.len();
        Self {
            inner: Arc::new(PoolInner {
                buckets,
                min_shift: config.min_bucket_shift,
                state: Mutex::new(PoolState {
                    free_lists: (0..bucket_count).map(|_| Vec::new()).collect(),
                    waiters: (0..bucket_count).map(|_| VecDeque::new()).collect(),
                }),
                upstream: Box::new(upstream),
                next_waiter_id: AtomicU64::new(0),
            }),
        }
    }

    /// A sender that completes with a [`PoolBuffer`] of at least `size` bytes.
    /// If the bucket for `size` is capped and currently exhausted, the
    /// returned operation parks until a same-sized block is freed.
    pub fn allocate(&self, size: usize) -> AllocateSender {
        AllocateSender {
            pool: self.inner.clone(),
            size,
            stop_token: StopToken::never(),
        }
    }

    /// Number of blocks minted from upstream for `size`'s bucket so far.
    /// Never decreases: freed blocks return to the bucket's free-list rather
    /// than back to upstream, so this tracks the bucket's high-water mark
    /// against its configured capacity.
    pub fn outstanding(&self, size: usize) -> Result<usize> {
        let idx = self.inner.bucket_index_for(size)?;
        Ok(self.inner.buckets[idx].outstanding.load(Ordering::Acquire))
    }
}

/// Lets `Pool` back [`fern_core::spawn_detached_in`]: the holder object a
/// detached operation is boxed into is a single fixed-size allocation, which
/// fits the same bucketed free-list this pool already serves I/O buffers
/// from, instead of going through the global allocator on every detach.
impl DetachAllocator for Pool {
    fn acquire(&self, layout: Layout) -> *mut u8 {
        let Ok(bucket_idx) = self.inner.bucket_index_for(layout.size()) else {
            return unsafe { std::alloc::alloc(layout) };
        };
        match self.inner.try_take(bucket_idx) {
            TakeOutcome::Got(ptr) => ptr.as_ptr(),
            // Capacity-parked or genuinely failed: this path can't await a
            // free, so fall back to a one-off allocation sized to the
            // bucket's block so `release` below can still hand it back to
            // the same free-list.
            TakeOutcome::Park | TakeOutcome::Failed => {
                let layout = self.inner.buckets[bucket_idx].layout();
                unsafe { std::alloc::alloc(layout) }
            }
        }
    }

    unsafe fn release(&self, ptr: *mut u8, layout: Layout) {
        let Some(nn) = NonNull::new(ptr) else { return };
        match self.inner.bucket_index_for(layout.size()) {
            Ok(bucket_idx) => self.inner.release(bucket_idx, nn),
            Err(_) => std::alloc::dealloc(ptr, layout),
        }
    }
}

/// A checked-out block of memory. Returns to its bucket's free-list (or is
/// handed directly to a parked waiter) when dropped.
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    requested_len: usize,
    block_size: usize,
    bucket: usize,
    pool: Weak<PoolInner>,
}

impl PoolBuffer {
    pub fn len(&self) -> usize {
        self.requested_len
    }

    pub fn is_empty(&self) -> bool {
        self.requested_len == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn as_const_buffer(&self) -> ConstBuffer<'_> {
        unsafe { ConstBuffer::from_raw_parts(self.ptr.as_ptr(), self.requested_len) }
    }

    pub fn as_mutable_buffer(&mut self) -> MutableBuffer<'_> {
        unsafe { MutableBuffer::from_raw_parts(self.ptr.as_ptr(), self.requested_len) }
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.bucket, self.ptr);
        } else {
            let layout = Layout::from_size_align(self.block_size, BLOCK_ALIGN).expect("buffer layout");
            unsafe { SystemUpstream.dealloc(self.ptr, layout) };
        }
    }
}

// SAFETY: a `PoolBuffer` owns its block exclusively until dropped; the block
// itself carries no thread affinity.
unsafe impl Send for PoolBuffer {}

/// A sender for one `Pool::allocate` request.
pub struct AllocateSender {
    pool: Arc<PoolInner>,
    size: usize,
    stop_token: StopToken,
}

impl AllocateSender {
    /// Cancel this allocation (if it ends up parking) when `token` fires.
    /// Has no effect on an allocation that completes immediately.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop_token = token;
        self
    }
}

impl Sender for AllocateSender {
    type Value = PoolBuffer;
    type Error = Error;
    type Operation<R>
        = AllocateOperation<R>
    where
        R: Receiver<Value = PoolBuffer, Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = PoolBuffer, Error = Error>,
    {
        AllocateOperation {
            pool: self.pool,
            size: self.size,
            stop_token: self.stop_token,
            receiver: Some(receiver),
        }
    }
}

pub struct AllocateOperation<R> {
    pool: Arc<PoolInner>,
    size: usize,
    stop_token: StopToken,
    receiver: Option<R>,
}

impl<R> Operation for AllocateOperation<R>
where
    R: Receiver<Value = PoolBuffer, Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let bucket_idx = match self.pool.bucket_index_for(self.size) {
            Ok(idx) => idx,
            Err(e) => {
                receiver.set_error(e);
                return;
            }
        };
        match self.pool.try_take(bucket_idx) {
            TakeOutcome::Got(ptr) => {
                let buf = PoolBuffer {
                    ptr,
                    requested_len: self.size,
                    block_size: self.pool.buckets[bucket_idx].block_size,
                    bucket: bucket_idx,
                    pool: Arc::downgrade(&self.pool),
                };
                receiver.set_value(buf);
            }
            TakeOutcome::Failed => {
                receiver.set_error(Error::AllocationFailed);
            }
            TakeOutcome::Park => {
                let requested_len = self.size;
                let id = self.pool.next_waiter_id();
                let pool_for_cancel = self.pool.clone();
                self.pool.park(
                    bucket_idx,
                    id,
                    Box::new(move |outcome| match outcome {
                        ParkOutcome::Value(mut buf) => {
                            buf.requested_len = requested_len;
                            receiver.set_value(buf);
                        }
                        ParkOutcome::Error(e) => receiver.set_error(e),
                        ParkOutcome::Stopped => receiver.set_stopped(),
                    }),
                );
                self.stop_token.on_stop(move || {
                    pool_for_cancel.cancel_parked(bucket_idx, id);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::pin::pin;
    use std::rc::Rc;
    use std::sync::Barrier;
    use std::thread;

    fn connect_and_start<S>(sender: S) -> Rc<RefCell<Option<Result<S::Value>>>>
    where
        S: Sender,
        S::Value: 'static,
        S::Error: 'static,
    {
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let result3 = result.clone();
        let receiver = fern_core::sender::FnReceiver {
            on_value: move |v| *result2.borrow_mut() = Some(Ok(v)),
            on_error: move |e| *result3.borrow_mut() = Some(Err(e)),
            on_stopped: || panic!("unexpected stop"),
        };
        let op = sender.connect(receiver);
        let mut op = op;
        pin!(op).as_mut().start();
        result
    }

    #[test]
    fn allocate_rounds_up_to_bucket_and_frees_to_list() {
        let pool = Pool::new(PoolConfig {
            min_bucket_shift: 6,
            max_bucket_shift: 10,
            capacity_per_bucket: Some(4),
        });
        let result = connect_and_start(pool.allocate(10));
        let buf = result.borrow_mut().take().unwrap().unwrap();
        assert_eq!(buf.block_size(), 64);
        assert_eq!(buf.len(), 10);
        drop(buf);
        assert_eq!(pool.outstanding(10).unwrap(), 1);
    }

    #[test]
    fn oversized_request_errors() {
        let pool = Pool::new(PoolConfig {
            min_bucket_shift: 6,
            max_bucket_shift: 8,
            capacity_per_bucket: Some(1),
        });
        let result = connect_and_start(pool.allocate(4096));
        assert!(matches!(result.borrow().as_ref().unwrap(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn exhausted_bucket_hands_block_to_waiter_on_free() {
        let pool = Pool::new(PoolConfig {
            min_bucket_shift: 6,
            max_bucket_shift: 6,
            capacity_per_bucket: Some(1),
        });
        let held = connect_and_start(pool.allocate(32));
        let held_buf = held.borrow_mut().take().unwrap().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let pool2 = pool.clone();
        let barrier2 = barrier.clone();
        let waiter_result: Arc<Mutex<Option<Result<PoolBuffer>>>> = Arc::new(Mutex::new(None));
        let waiter_result2 = waiter_result.clone();
        let handle = thread::spawn(move || {
            let receiver = fern_core::sender::FnReceiver {
                on_value: move |v| *waiter_result2.lock().unwrap() = Some(Ok(v)),
                on_error: move |_: Error| {},
                on_stopped: || {},
            };
            let mut op = pool2.allocate(32).connect(receiver);
            barrier2.wait();
            unsafe { Pin::new_unchecked(&mut op) }.start();
        });
        barrier.wait();
        // give the spawned waiter a moment to park before we free.
        thread::sleep(std::time::Duration::from_millis(20));
        drop(held_buf);
        handle.join().unwrap();
        assert!(waiter_result.lock().unwrap().take().unwrap().is_ok());
    }

    #[test]
    fn cancelling_a_parked_allocation_delivers_stopped() {
        let pool = Pool::new(PoolConfig {
            min_bucket_shift: 6,
            max_bucket_shift: 6,
            capacity_per_bucket: Some(1),
        });
        let held = connect_and_start(pool.allocate(32));
        let _held_buf = held.borrow_mut().take().unwrap().unwrap();

        let stop_source = fern_core::StopSource::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let stopped2 = stopped.clone();
        let receiver = fern_core::sender::FnReceiver {
            on_value: |_: PoolBuffer| panic!("unexpected value"),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: move || {
                stopped2.fetch_add(1, Ordering::AcqRel);
            },
        };
        let mut op = pin!(pool
            .allocate(32)
            .with_stop_token(stop_source.token())
            .connect(receiver));
        op.as_mut().start();
        stop_source.request_stop();
        assert_eq!(stopped.load(Ordering::Acquire), 1);
    }

    struct FailingUpstream;
    impl Upstream for FailingUpstream {
        fn alloc(&self, _layout: Layout) -> Option<NonNull<u8>> {
            None
        }
        unsafe fn dealloc(&self, _ptr: NonNull<u8>, _layout: Layout) {}
    }

    #[test]
    fn genuine_upstream_failure_errors_instead_of_parking_forever() {
        let pool = Pool::with_upstream(
            PoolConfig {
                min_bucket_shift: 6,
                max_bucket_shift: 6,
                capacity_per_bucket: None,
            },
            FailingUpstream,
        );
        let result = connect_and_start(pool.allocate(32));
        assert!(matches!(result.borrow().as_ref().unwrap(), Err(Error::AllocationFailed)));
    }
}
