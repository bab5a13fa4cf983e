//! The lazy-sequence algebra built on top of `fern-core`'s
//! [`SequenceSender`]/[`SequenceReceiver`] contract: `iterate` produces a
//! sequence, combinators like `then_each`/`fork`/`zip`/`scan` transform or
//! combine one, and `first`/`last`/`reduce`/`ignore_all` collapse one back
//! down to a plain [`Sender`].
//!
//! [`Sender`]: fern_core::Sender

pub mod buffered;
pub mod collapse;
pub(crate) mod detach_pool;
pub mod finally;
pub mod fork;
pub mod iterate;
pub mod map;
pub mod merge;
pub mod repeat;
pub mod scan;
pub mod zip;

pub use buffered::{buffered_sequence, ByteView};
pub use collapse::{first, ignore_all, last};
pub use finally::{finally, tap, Outcome};
pub use fork::fork;
pub use iterate::iterate;
pub use map::{let_value_each, then_each, transform_each};
pub use merge::merge_each;
pub use repeat::repeat;
pub use scan::{reduce, scan};
pub use zip::zip;
