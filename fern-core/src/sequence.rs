//! Sequence-sender vocabulary: cardinality, parallelism, and the
//! `set_next`/`set_value` completion contract built on top of [`crate::sender`].
//!
//! A sequence sender is a sender whose "value" is a series of items delivered
//! through repeated calls to [`SequenceReceiver::set_next`], terminated by
//! exactly one of the ordinary `Receiver` completions. `fern-seq`'s
//! combinators (`iterate`, `then_each`, `fork`, ...) all build on this trait
//! rather than reimplementing their own notion of "a stream".

use crate::sender::{Receiver, Sender};

/// How many items a sequence sender is known to produce, if knowable ahead of
/// time. Combinators like `buffered_sequence` use this to avoid growing an
/// unbounded backlog when the count is known and small.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly `n` items, known before the first item is produced.
    Finite(usize),
    /// An unknown, possibly unbounded, number of items.
    Unbounded,
}

/// Whether a sequence's items may be processed concurrently with each other,
/// or must be processed one at a time in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    /// Each item's downstream work must complete before the next item is
    /// produced (`lock_step`). Required when downstream state isn't safe to
    /// share across concurrently in-flight items.
    LockStep,
    /// Up to `limit` items may be in flight concurrently (`many_sender`).
    /// `limit == None` means no explicit cap beyond what the scheduler imposes.
    Concurrent { limit: Option<usize> },
}

impl Parallelism {
    pub fn is_lock_step(&self) -> bool {
        matches!(self, Self::LockStep)
    }
}

/// A receiver for a sequence of values of type `Item`, terminated by the
/// ordinary [`Receiver`] completions (value/error/stopped) for `Value`/`Error`.
pub trait SequenceReceiver: Receiver {
    type Item;
    /// The sender to run for one item; its completion signals readiness for
    /// the next item (or the sequence's overall completion, for the last one).
    type NextSender: Sender<Value = (), Error = Self::Error>;

    /// Deliver the next item. The returned sender must complete before the
    /// sequence is permitted to produce another item under `Parallelism::LockStep`;
    /// under `Parallelism::Concurrent`, several may be outstanding at once.
    fn set_next(&self, item: Self::Item) -> Self::NextSender;
}

/// A sender whose value is a series of items rather than a single value.
pub trait SequenceSender {
    type Item;
    type Error;
    type Operation<R>: crate::sender::Operation
    where
        R: SequenceReceiver<Item = Self::Item, Error = Self::Error, Value = ()>;

    /// The number of items this sender will produce, if known without running it.
    fn cardinality(&self) -> Cardinality {
        Cardinality::Unbounded
    }

    /// The parallelism this sender requires of its items' downstream work.
    fn parallelism(&self) -> Parallelism {
        Parallelism::LockStep
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = Self::Item, Error = Self::Error, Value = ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_step_is_lock_step() {
        assert!(Parallelism::LockStep.is_lock_step());
        assert!(!Parallelism::Concurrent { limit: None }.is_lock_step());
    }

    #[test]
    fn cardinality_equality() {
        assert_eq!(Cardinality::Finite(3), Cardinality::Finite(3));
        assert_ne!(Cardinality::Finite(3), Cardinality::Unbounded);
    }
}
