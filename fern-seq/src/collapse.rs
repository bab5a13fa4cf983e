//! Collapsing a sequence down to a single-value sender: `first`, `last`,
//! `ignore_all`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::sender::JustSender;
use fern_core::sequence::{SequenceReceiver, SequenceSender};
use fern_core::{Error, Operation, Receiver, Sender};

/// Completes with the first item `seq` produces, discarding the rest.
/// `None` if `seq` completes having produced no items.
pub fn first<S>(seq: S) -> FirstSender<S>
where
    S: SequenceSender<Error = Error>,
{
    FirstSender { seq }
}

pub struct FirstSender<S> {
    seq: S,
}

impl<S> Sender for FirstSender<S>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    S::Item: Send + 'static,
{
    type Value = Option<S::Item>;
    type Error = Error;
    type Operation<R>
        = CollapseOperation<S, R>
    where
        R: Receiver<Value = Option<S::Item>, Error = Error> + Send + 'static;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Option<S::Item>, Error = Error> + Send + 'static,
    {
        CollapseOperation {
            seq: Some(self.seq),
            state: Arc::new(CollapseState {
                receiver: Mutex::new(Some(receiver)),
                latest: Mutex::new(None),
                mode: Mode::First,
                emplaced: AtomicBool::new(false),
            }),
        }
    }
}

/// Completes with the last item `seq` produces (or `None` if it produces
/// none), only once `seq` itself finishes.
pub fn last<S>(seq: S) -> LastSender<S>
where
    S: SequenceSender<Error = Error>,
{
    LastSender { seq }
}

pub struct LastSender<S> {
    seq: S,
}

impl<S> Sender for LastSender<S>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    S::Item: Send + 'static,
{
    type Value = Option<S::Item>;
    type Error = Error;
    type Operation<R>
        = CollapseOperation<S, R>
    where
        R: Receiver<Value = Option<S::Item>, Error = Error> + Send + 'static;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Option<S::Item>, Error = Error> + Send + 'static,
    {
        CollapseOperation {
            seq: Some(self.seq),
            state: Arc::new(CollapseState {
                receiver: Mutex::new(Some(receiver)),
                latest: Mutex::new(None),
                mode: Mode::Last,
                emplaced: AtomicBool::new(false),
            }),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    First,
    Last,
}

struct CollapseState<T, R> {
    receiver: Mutex<Option<R>>,
    latest: Mutex<Option<T>>,
    mode: Mode,
    /// Set once the outer receiver has been completed, so `first` can
    /// ignore every item after the one it already delivered.
    emplaced: AtomicBool,
}

impl<T, R> CollapseState<T, R>
where
    R: Receiver<Value = Option<T>, Error = Error>,
{
    fn record(&self, item: T) {
        match self.mode {
            Mode::First => {
                if !self.emplaced.swap(true, Ordering::AcqRel) {
                    if let Some(receiver) = self.receiver.lock().unwrap().take() {
                        receiver.set_value(Some(item));
                    }
                }
            }
            Mode::Last => {
                *self.latest.lock().unwrap() = Some(item);
            }
        }
    }

    fn finish(&self, outcome: Result<(), Error>) {
        if self.emplaced.swap(true, Ordering::AcqRel) {
            return;
        }
        let receiver = match self.receiver.lock().unwrap().take() {
            Some(receiver) => receiver,
            None => return,
        };
        match outcome {
            Ok(()) => receiver.set_value(self.latest.lock().unwrap().take()),
            Err(error) => receiver.set_error(error),
        }
    }
}

pub struct CollapseOperation<S, R>
where
    S: SequenceSender,
{
    seq: Option<S>,
    state: Arc<CollapseState<S::Item, R>>,
}

impl<S, R> Operation for CollapseOperation<S, R>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    S::Item: Send + 'static,
    R: Receiver<Value = Option<S::Item>, Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let seq = self.seq.take().expect("start called twice");
        let op = seq.connect(CollapseReceiver {
            state: self.state.clone(),
        });
        let boxed: Pin<Box<dyn Operation>> = Box::pin(op);
        // SAFETY: leaked immediately, so the pinned operation never moves.
        let leaked_box = unsafe { Pin::into_inner_unchecked(boxed) };
        let leaked: &'static mut dyn Operation = Box::leak(leaked_box);
        unsafe { Pin::new_unchecked(leaked) }.start();
    }
}

struct CollapseReceiver<T, R> {
    state: Arc<CollapseState<T, R>>,
}

impl<T, R> Receiver for CollapseReceiver<T, R>
where
    R: Receiver<Value = Option<T>, Error = Error>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.state.finish(Ok(()));
    }
    fn set_error(self, error: Error) {
        self.state.finish(Err(error));
    }
    fn set_stopped(self) {
        self.state.finish(Ok(()));
    }
}

impl<T, R> SequenceReceiver for CollapseReceiver<T, R>
where
    R: Receiver<Value = Option<T>, Error = Error>,
{
    type Item = T;
    type NextSender = JustSender<(), Error>;
    fn set_next(&self, item: T) -> Self::NextSender {
        self.state.record(item);
        JustSender::new(())
    }
}

/// Drains `seq`, discarding every item, and completes with `value()` or
/// `seq`'s first error.
pub fn ignore_all<S>(seq: S) -> IgnoreAllSender<S>
where
    S: SequenceSender<Error = Error>,
{
    IgnoreAllSender { seq }
}

pub struct IgnoreAllSender<S> {
    seq: S,
}

impl<S> Sender for IgnoreAllSender<S>
where
    S: SequenceSender<Error = Error> + Send + 'static,
    S::Item: Send + 'static,
{
    type Value = ();
    type Error = Error;
    type Operation<R>
        = S::Operation<IgnoreAllReceiver<R>>
    where
        R: Receiver<Value = (), Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = (), Error = Error>,
    {
        self.seq.connect(IgnoreAllReceiver { receiver })
    }
}

pub struct IgnoreAllReceiver<R> {
    receiver: R,
}

impl<R> Receiver for IgnoreAllReceiver<R>
where
    R: Receiver<Value = (), Error = Error>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, value: ()) {
        self.receiver.set_value(value);
    }
    fn set_error(self, error: Error) {
        self.receiver.set_error(error);
    }
    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

impl<R, T> SequenceReceiver for IgnoreAllReceiver<R>
where
    R: Receiver<Value = (), Error = Error>,
{
    type Item = T;
    type NextSender = JustSender<(), Error>;
    fn set_next(&self, _item: T) -> Self::NextSender {
        JustSender::new(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::iterate;
    use fern_core::sender::FnReceiver;
    use std::cell::RefCell;
    use std::pin::pin;
    use std::rc::Rc;

    #[test]
    fn first_completes_with_the_first_item() {
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: Option<u32>| *observed2.borrow_mut() = Some(v),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(first(iterate(0..10u32)).connect(receiver));
        op.as_mut().start();
        assert_eq!(*observed.borrow(), Some(Some(0)));
    }

    #[test]
    fn first_of_empty_sequence_is_none() {
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: Option<u32>| *observed2.borrow_mut() = Some(v),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(first(iterate(0..0u32)).connect(receiver));
        op.as_mut().start();
        assert_eq!(*observed.borrow(), Some(None));
    }

    #[test]
    fn last_completes_with_the_final_item() {
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: Option<u32>| *observed2.borrow_mut() = Some(v),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(last(iterate(0..5u32)).connect(receiver));
        op.as_mut().start();
        assert_eq!(*observed.borrow(), Some(Some(4)));
    }

    #[test]
    fn ignore_all_discards_items_and_completes() {
        let observed = Rc::new(RefCell::new(false));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |_: ()| *observed2.borrow_mut() = true,
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(ignore_all(iterate(0..5u32)).connect(receiver));
        op.as_mut().start();
        assert!(*observed.borrow());
    }
}
