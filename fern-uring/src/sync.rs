//! Swaps in `loom`'s shadow synchronization primitives when built with
//! `--cfg loom`, the same way `fern_core::sync` does, so `loom::model` can
//! explore interleavings of [`crate::ring`]'s head/tail atomics. Run with
//! `RUSTFLAGS="--cfg loom" cargo test --release loom_tests`.

#[cfg(loom)]
pub use loom::sync::*;
#[cfg(not(loom))]
pub use std::sync::*;
