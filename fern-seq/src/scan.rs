//! `scan`: thread an accumulator through every item, re-emitting it as the
//! downstream item. `reduce` collapses the same threading down to the final
//! accumulated value, the way `last` collapses a plain sequence.

use std::sync::Mutex;

use fern_core::sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
use fern_core::{Error, Receiver};

use crate::collapse::last;

/// Threads `init` through `f` across every item `seq` produces, emitting the
/// updated accumulator downstream in place of the raw item. Parallelism is
/// inherited from `seq`; when that's anything but `lock_step`, `f` runs
/// under a mutex rather than lock-free, since two items could otherwise
/// race on the same accumulator slot.
pub fn scan<S, Acc, F>(seq: S, init: Acc, f: F) -> ScanSender<S, Acc, F>
where
    S: SequenceSender<Error = Error>,
    F: Fn(&Acc, S::Item) -> Acc + Send + 'static,
    Acc: Clone + Send + 'static,
{
    ScanSender { seq, init, f }
}

pub struct ScanSender<S, Acc, F> {
    seq: S,
    init: Acc,
    f: F,
}

impl<S, Acc, F> SequenceSender for ScanSender<S, Acc, F>
where
    S: SequenceSender<Error = Error>,
    F: Fn(&Acc, S::Item) -> Acc + Send + 'static,
    Acc: Clone + Send + 'static,
{
    type Item = Acc;
    type Error = Error;
    type Operation<R>
        = S::Operation<ScanReceiver<R, Acc, F>>
    where
        R: SequenceReceiver<Item = Acc, Error = Error, Value = ()>;

    fn cardinality(&self) -> Cardinality {
        self.seq.cardinality()
    }

    fn parallelism(&self) -> Parallelism {
        self.seq.parallelism()
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = Acc, Error = Error, Value = ()>,
    {
        self.seq.connect(ScanReceiver {
            receiver,
            state: Mutex::new(self.init),
            f: self.f,
        })
    }
}

pub struct ScanReceiver<R, Acc, F> {
    receiver: R,
    state: Mutex<Acc>,
    f: F,
}

impl<R, Acc, F> Receiver for ScanReceiver<R, Acc, F>
where
    R: Receiver,
{
    type Value = R::Value;
    type Error = R::Error;
    fn set_value(self, value: Self::Value) {
        self.receiver.set_value(value);
    }
    fn set_error(self, error: Self::Error) {
        self.receiver.set_error(error);
    }
    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

impl<R, Acc, F, A> SequenceReceiver for ScanReceiver<R, Acc, F>
where
    R: SequenceReceiver<Item = Acc>,
    F: Fn(&Acc, A) -> Acc,
    Acc: Clone,
{
    type Item = A;
    type NextSender = R::NextSender;
    fn set_next(&self, item: A) -> Self::NextSender {
        let mut guard = self.state.lock().unwrap();
        let updated = (self.f)(&guard, item);
        *guard = updated.clone();
        drop(guard);
        self.receiver.set_next(updated)
    }
}

/// Folds every item `seq` produces into a single accumulated value, starting
/// from `init`. An empty `seq` yields `init` unchanged.
pub fn reduce<S, Acc, F>(seq: S, init: Acc, f: F) -> ReduceSender<S, Acc, F>
where
    S: SequenceSender<Error = Error>,
    F: Fn(&Acc, S::Item) -> Acc + Send + 'static,
    Acc: Clone + Send + 'static,
{
    ReduceSender { seq, init, f }
}

pub struct ReduceSender<S, Acc, F> {
    seq: S,
    init: Acc,
    f: F,
}

impl<S, Acc, F> fern_core::Sender for ReduceSender<S, Acc, F>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    F: Fn(&Acc, S::Item) -> Acc + Send + 'static,
    Acc: Clone + Send + 'static,
{
    type Value = Acc;
    type Error = Error;
    type Operation<R>
        = ReduceOperation<S, Acc, F, R>
    where
        R: Receiver<Value = Acc, Error = Error> + Send + 'static;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Acc, Error = Error> + Send + 'static,
    {
        ReduceOperation {
            inner: last(scan(self.seq, self.init.clone(), self.f)).connect(ReduceReceiver {
                init: self.init,
                receiver,
            }),
        }
    }
}

pub struct ReduceOperation<S, Acc, F, R>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    F: Fn(&Acc, S::Item) -> Acc + Send + 'static,
    Acc: Clone + Send + 'static,
    R: Receiver<Value = Acc, Error = Error> + Send + 'static,
{
    inner: crate::collapse::CollapseOperation<ScanSender<S, Acc, F>, ReduceReceiver<Acc, R>>,
}

impl<S, Acc, F, R> fern_core::Operation for ReduceOperation<S, Acc, F, R>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    F: Fn(&Acc, S::Item) -> Acc + Send + 'static,
    Acc: Clone + Send + 'static,
    R: Receiver<Value = Acc, Error = Error> + Send + 'static,
{
    fn start(mut self: std::pin::Pin<&mut Self>) {
        std::pin::Pin::new(&mut self.inner).start();
    }
}

struct ReduceReceiver<Acc, R> {
    init: Acc,
    receiver: R,
}

impl<Acc, R> Receiver for ReduceReceiver<Acc, R>
where
    R: Receiver<Value = Acc, Error = Error>,
{
    type Value = Option<Acc>;
    type Error = Error;
    fn set_value(self, value: Option<Acc>) {
        self.receiver.set_value(value.unwrap_or(self.init));
    }
    fn set_error(self, error: Error) {
        self.receiver.set_error(error);
    }
    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::iterate;
    use fern_core::sender::{FnReceiver, JustSender};
    use std::cell::RefCell;
    use std::pin::pin;
    use std::rc::Rc;

    #[test]
    fn scan_emits_running_totals() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        struct CollectReceiver {
            seen: Rc<RefCell<Vec<u32>>>,
        }
        impl Receiver for CollectReceiver {
            type Value = ();
            type Error = Error;
            fn set_value(self, _: ()) {}
            fn set_error(self, error: Error) {
                panic!("unexpected error: {error:?}");
            }
            fn set_stopped(self) {
                panic!("unexpected stop");
            }
        }
        impl SequenceReceiver for CollectReceiver {
            type Item = u32;
            type NextSender = JustSender<(), Error>;
            fn set_next(&self, item: u32) -> Self::NextSender {
                self.seen.borrow_mut().push(item);
                JustSender::new(())
            }
        }
        let receiver = CollectReceiver { seen: seen2 };
        let seq = scan(iterate(1..5u32), 0u32, |acc, item| acc + item);
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        assert_eq!(*seen.borrow(), vec![1, 3, 6, 10]);
    }

    #[test]
    fn reduce_folds_to_a_single_value() {
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: u32| *observed2.borrow_mut() = Some(v),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(reduce(iterate(1..5u32), 0u32, |acc, item| acc + item).connect(receiver));
        op.as_mut().start();
        assert_eq!(*observed.borrow(), Some(10));
    }

    #[test]
    fn reduce_of_empty_sequence_yields_init() {
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: u32| *observed2.borrow_mut() = Some(v),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(reduce(iterate(0..0u32), 7u32, |acc, item| acc + item).connect(receiver));
        op.as_mut().start();
        assert_eq!(*observed.borrow(), Some(7));
    }
}
