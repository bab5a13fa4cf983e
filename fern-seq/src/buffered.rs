//! `buffered_sequence`: turn a single buffer view and a starting offset into
//! a sequence of `bytes_transferred` items, one per kernel call, advancing
//! the view and offset by the reported count after each success until the
//! view is drained. Used by high-level `read`/`write` to turn a
//! possibly-short byte-stream primitive into a loop over the full range.
//!
//! Driving is trampolined the same way [`crate::iterate`] is: each step is
//! itself a two-hop async chain (the factory's sender, then the downstream
//! item body), but the `running`/`pending` pair still bounds the stack to
//! O(1) regardless of how many steps complete synchronously in a row.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::buffer::{ConstBuffer, MutableBuffer};
use fern_core::sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
use fern_core::{spawn_detached, DetachableInto, Error, Operation, Receiver, Sender};

/// A buffer-like view that knows how much is left and can be advanced past
/// bytes already consumed.
pub trait ByteView: Sized {
    fn remaining(&self) -> usize;
    fn advance(self, n: usize) -> Self;
}

impl<'a> ByteView for ConstBuffer<'a> {
    fn remaining(&self) -> usize {
        self.len()
    }
    fn advance(self, n: usize) -> Self {
        ConstBuffer::advance(&self, n)
    }
}

impl<'a> ByteView for MutableBuffer<'a> {
    fn remaining(&self) -> usize {
        self.len()
    }
    fn advance(self, n: usize) -> Self {
        MutableBuffer::advance(self, n)
    }
}

pub fn buffered_sequence<View, F, S>(
    sender_factory: F,
    buffer: View,
    offset: u64,
) -> BufferedSequenceSender<View, F>
where
    View: ByteView + Send + 'static,
    F: Fn(&View, u64) -> S + Send + 'static,
    S: Sender<Value = usize, Error = Error> + Send + 'static,
{
    BufferedSequenceSender {
        sender_factory,
        buffer,
        offset,
    }
}

pub struct BufferedSequenceSender<View, F> {
    sender_factory: F,
    buffer: View,
    offset: u64,
}

impl<View, F, S> SequenceSender for BufferedSequenceSender<View, F>
where
    View: ByteView + Send + 'static,
    F: Fn(&View, u64) -> S + Send + 'static,
    S: Sender<Value = usize, Error = Error> + Send + 'static,
{
    type Item = usize;
    type Error = Error;
    type Operation<R>
        = BufferedSequenceOperation<View, F, S, R>
    where
        R: SequenceReceiver<Item = usize, Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<AdvanceReceiver<View, F, S, R>>,
        S: DetachableInto<FactoryReceiver<View, F, S, R>>;

    fn cardinality(&self) -> Cardinality {
        Cardinality::Unbounded
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism::LockStep
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = usize, Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<AdvanceReceiver<View, F, S, R>>,
        S: DetachableInto<FactoryReceiver<View, F, S, R>>,
    {
        BufferedSequenceOperation {
            sender_factory: Some(self.sender_factory),
            buffer: Some(self.buffer),
            offset: self.offset,
            receiver: Some(receiver),
        }
    }
}

pub struct BufferedSequenceOperation<View, F, S, R> {
    sender_factory: Option<F>,
    buffer: Option<View>,
    offset: u64,
    receiver: Option<R>,
}

struct Driver<View, F, S, R> {
    sender_factory: F,
    state: Mutex<Option<(View, u64)>>,
    receiver: Mutex<Option<R>>,
    running: AtomicBool,
    pending: AtomicBool,
    _marker: std::marker::PhantomData<fn() -> S>,
}

impl<View, F, S, R> Operation for BufferedSequenceOperation<View, F, S, R>
where
    View: ByteView + Send + 'static,
    F: Fn(&View, u64) -> S + Send + 'static,
    S: Sender<Value = usize, Error = Error> + Send + 'static,
    R: SequenceReceiver<Item = usize, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<View, F, S, R>>,
    S: DetachableInto<FactoryReceiver<View, F, S, R>>,
{
    fn start(mut self: Pin<&mut Self>) {
        let sender_factory = self.sender_factory.take().expect("start called twice");
        let buffer = self.buffer.take().expect("start called twice");
        let receiver = self.receiver.take().expect("start called twice");
        let driver = Arc::new(Driver {
            sender_factory,
            state: Mutex::new(Some((buffer, self.offset))),
            receiver: Mutex::new(Some(receiver)),
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            _marker: std::marker::PhantomData,
        });
        advance(driver);
    }
}

fn advance<View, F, S, R>(driver: Arc<Driver<View, F, S, R>>)
where
    View: ByteView + Send + 'static,
    F: Fn(&View, u64) -> S + Send + 'static,
    S: Sender<Value = usize, Error = Error> + Send + 'static,
    R: SequenceReceiver<Item = usize, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<View, F, S, R>>,
    S: DetachableInto<FactoryReceiver<View, F, S, R>>,
{
    if driver.running.swap(true, Ordering::AcqRel) {
        driver.pending.store(true, Ordering::Release);
        return;
    }
    loop {
        let (view, offset) = driver
            .state
            .lock()
            .unwrap()
            .take()
            .expect("buffered_sequence state consumed twice");
        if view.remaining() == 0 {
            driver.running.store(false, Ordering::Release);
            if let Some(receiver) = driver.receiver.lock().unwrap().take() {
                receiver.set_value(());
            }
            return;
        }
        let sender = (driver.sender_factory)(&view, offset);
        driver.pending.store(false, Ordering::Release);
        spawn_detached(
            sender,
            FactoryReceiver {
                driver: driver.clone(),
                view,
                offset,
            },
        );
        if !driver.pending.load(Ordering::Acquire) {
            driver.running.store(false, Ordering::Release);
            return;
        }
    }
}

pub struct FactoryReceiver<View, F, S, R> {
    driver: Arc<Driver<View, F, S, R>>,
    view: View,
    offset: u64,
}

impl<View, F, S, R> Receiver for FactoryReceiver<View, F, S, R>
where
    View: ByteView + Send + 'static,
    F: Fn(&View, u64) -> S + Send + 'static,
    S: Sender<Value = usize, Error = Error> + Send + 'static,
    R: SequenceReceiver<Item = usize, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<View, F, S, R>>,
{
    type Value = usize;
    type Error = Error;

    fn set_value(self, transferred: usize) {
        let advanced = self.view.advance(transferred);
        let new_offset = self.offset + transferred as u64;
        *self.driver.state.lock().unwrap() = Some((advanced, new_offset));
        let next_sender = {
            let guard = self.driver.receiver.lock().unwrap();
            guard
                .as_ref()
                .expect("receiver already consumed")
                .set_next(transferred)
        };
        spawn_detached(
            next_sender,
            AdvanceReceiver {
                driver: self.driver,
            },
        );
    }

    fn set_error(self, error: Error) {
        if let Some(receiver) = self.driver.receiver.lock().unwrap().take() {
            receiver.set_error(error);
        }
    }

    fn set_stopped(self) {
        if let Some(receiver) = self.driver.receiver.lock().unwrap().take() {
            receiver.set_stopped();
        }
    }
}

pub struct AdvanceReceiver<View, F, S, R> {
    driver: Arc<Driver<View, F, S, R>>,
}

impl<View, F, S, R> Receiver for AdvanceReceiver<View, F, S, R>
where
    View: ByteView + Send + 'static,
    F: Fn(&View, u64) -> S + Send + 'static,
    S: Sender<Value = usize, Error = Error> + Send + 'static,
    R: SequenceReceiver<Item = usize, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<View, F, S, R>>,
    S: DetachableInto<FactoryReceiver<View, F, S, R>>,
{
    type Value = ();
    type Error = Error;

    fn set_value(self, _: ()) {
        advance(self.driver);
    }

    fn set_error(self, error: Error) {
        if let Some(receiver) = self.driver.receiver.lock().unwrap().take() {
            receiver.set_error(error);
        }
    }

    fn set_stopped(self) {
        if let Some(receiver) = self.driver.receiver.lock().unwrap().take() {
            receiver.set_stopped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_core::sender::JustSender;
    use std::pin::pin;
    use std::sync::mpsc;

    /// A view over a plain counter, standing in for a real buffer, so these
    /// tests can exercise the draining loop without touching raw memory.
    #[derive(Clone, Copy)]
    struct CountingView {
        remaining: usize,
    }

    impl ByteView for CountingView {
        fn remaining(&self) -> usize {
            self.remaining
        }
        fn advance(self, n: usize) -> Self {
            CountingView {
                remaining: self.remaining - n,
            }
        }
    }

    struct CollectReceiver {
        seen: Arc<Mutex<Vec<usize>>>,
        done: mpsc::Sender<()>,
    }

    impl Receiver for CollectReceiver {
        type Value = ();
        type Error = Error;
        fn set_value(self, _: ()) {
            self.done.send(()).unwrap();
        }
        fn set_error(self, error: Error) {
            panic!("unexpected error: {error:?}");
        }
        fn set_stopped(self) {
            panic!("unexpected stop");
        }
    }

    impl SequenceReceiver for CollectReceiver {
        type Item = usize;
        type NextSender = JustSender<(), Error>;
        fn set_next(&self, item: usize) -> Self::NextSender {
            self.seen.lock().unwrap().push(item);
            JustSender::new(())
        }
    }

    #[test]
    fn drains_the_view_in_fixed_size_chunks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let receiver = CollectReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let seq = buffered_sequence(
            |view: &CountingView, _offset| JustSender::<usize, Error>::new(view.remaining().min(3)),
            CountingView { remaining: 10 },
            0,
        );
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3, 3, 3, 1]);
    }

    #[test]
    fn empty_view_completes_immediately() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let receiver = CollectReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let seq = buffered_sequence(
            |view: &CountingView, _offset| JustSender::<usize, Error>::new(view.remaining()),
            CountingView { remaining: 0 },
            0,
        );
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }
}
