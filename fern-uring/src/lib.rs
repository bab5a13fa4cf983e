//! The io_uring execution runtime: the context that owns the ring and drives
//! its run loop, the static worker pool it falls back to for blocking
//! syscalls, the SPMC stealable-task ring workers share, and the
//! cross-thread submission handoff that lets any thread hand work to a
//! context it doesn't own.

pub mod config;
pub mod context;
pub mod notifier;
pub mod ops;
pub mod pool;
pub mod ring;
pub mod submit_queue;
pub(crate) mod sync;
pub mod task;

pub use config::{Config, PoolConfig};
pub use context::{Handle, IoUringContext, ScheduleSender};
pub use notifier::EventFdNotifier;
pub use pool::{WorkerPool, WorkerPoolHandle};
pub use submit_queue::SubmitQueue;
pub use task::{CorrelationIds, RawTask, SubmitItem, TaskVTable, NO_CORRELATION};
