//! A pool with its bucket capacity exhausted: `N` allocations succeed
//! immediately, the `N + 1`th parks, and freeing one of the first `N` hands
//! its block straight to the parked request.

use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use fern_core::sender::FnReceiver;
use fern_core::{Operation, Sender};
use fern_mem::{Pool, PoolBuffer, PoolConfig};

const N: usize = 4;

#[test]
fn parked_allocation_completes_once_a_block_is_freed() {
    let pool = Pool::new(PoolConfig {
        min_bucket_shift: 6,
        max_bucket_shift: 6,
        capacity_per_bucket: Some(N),
    });

    let values = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let mut held = Vec::new();
    for _ in 0..N {
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let values2 = values.clone();
        let errors2 = errors.clone();
        let receiver = FnReceiver {
            on_value: move |buf| {
                values2.fetch_add(1, Ordering::AcqRel);
                *result2.lock().unwrap() = Some(buf);
            },
            on_error: move |_| {
                errors2.fetch_add(1, Ordering::AcqRel);
            },
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(pool.allocate(32).connect(receiver));
        op.as_mut().start();
        held.push(result.lock().unwrap().take().expect("allocation should succeed immediately"));
    }
    assert_eq!(pool.outstanding(32).unwrap(), N);

    // The N+1th allocation exhausts the bucket's capacity and must park
    // rather than complete inline.
    let barrier = Arc::new(Barrier::new(2));
    let barrier2 = barrier.clone();
    let pool2 = pool.clone();
    let parked_result: Arc<Mutex<Option<PoolBuffer>>> = Arc::new(Mutex::new(None));
    let parked_result2 = parked_result.clone();
    let values2 = values.clone();
    let errors2 = errors.clone();
    let waiter = thread::spawn(move || {
        let receiver = FnReceiver {
            on_value: move |buf| {
                values2.fetch_add(1, Ordering::AcqRel);
                *parked_result2.lock().unwrap() = Some(buf);
            },
            on_error: move |_| {
                errors2.fetch_add(1, Ordering::AcqRel);
            },
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pool2.allocate(32).connect(receiver);
        barrier2.wait();
        unsafe { Pin::new_unchecked(&mut op) }.start();
    });
    barrier.wait();
    // Give the waiter thread a moment to actually park before we free.
    thread::sleep(Duration::from_millis(20));

    held.pop().expect("one held buffer to free");
    waiter.join().expect("waiter thread should not panic");

    assert!(parked_result.lock().unwrap().is_some(), "parked allocation should have completed");
    assert_eq!(values.load(Ordering::Acquire), N + 1);
    assert_eq!(errors.load(Ordering::Acquire), 0);
}
