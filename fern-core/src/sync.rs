//! Swaps in `loom`'s shadow synchronization primitives when built with
//! `--cfg loom` so that `loom::model` can actually explore interleavings of
//! the atomics used by [`crate::queue::MpscQueue`]; `std::sync` otherwise.
//! Run with `RUSTFLAGS="--cfg loom" cargo test --release loom_tests`.

#[cfg(loom)]
pub use loom::sync::*;
#[cfg(not(loom))]
pub use std::sync::*;
