//! I/O operations, the async resource protocol, and the channel/mutex
//! primitives built on top of `fern-core`'s sender/receiver contract and
//! `fern-uring`'s context.
//!
//! This is the layer application code actually touches: `use_resource`
//! around a [`file::OpenFile`] or [`net::TcpListener::accept`] gets
//! deterministic close-on-every-exit-path for free, and [`mutex::AsyncMutex`]
//! / [`channel::AsyncChannel`] give the concurrency primitives the sequence
//! algebra (`fern-seq`) is built from.

pub mod channel;
pub mod file;
pub mod mutex;
pub mod net;
pub mod resolve;
pub mod resource;
pub mod sqe;

pub use channel::AsyncChannel;
pub use mutex::{AsyncMutex, MutexGuard};
pub use resolve::resolve_first_ipv4;
pub use resource::{use_resource, Resource, Token};
pub use sqe::{IoSender, SqeOp};
