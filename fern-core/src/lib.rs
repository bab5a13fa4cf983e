//! Sender/receiver primitives, buffer views, cancellation, and the error type
//! shared by every other crate in the workspace.
//!
//! This crate has no dependency on `io-uring` or any particular transport —
//! it describes the completion contract (`Sender`/`Receiver`/`Operation`),
//! the sequence-sender vocabulary sequences are built from, and the handful
//! of concurrency primitives (the MPSC queue, the stop-token tree) that the
//! rest of the framework assembles into an actual runtime.

pub mod buffer;
pub mod cancel;
pub mod detached;
pub mod env;
pub mod error;
pub mod logging;
pub mod queue;
pub mod sender;
pub mod sequence;
pub(crate) mod sync;

pub use buffer::{
    ConstBuffer, ConstBufferSpan, ConstBufferSubspan, MutableBuffer, MutableBufferSpan,
    MutableBufferSubspan,
};
pub use cancel::{StopSource, StopToken};
pub use detached::{spawn_detached, spawn_detached_in, DetachAllocator, DetachReceiver, DetachableInto};
pub use error::{Error, Result};
pub use queue::MpscQueue;
pub use sender::{Operation, Receiver, Sender};
pub use sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
