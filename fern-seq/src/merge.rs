//! `merge_each(left, right)`: interleave items from both inputs in arrival
//! order; one error cancels the rest. N-ary merge nests the same way `zip`
//! does.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::sender::JustSender;
use fern_core::sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
use fern_core::{DetachableInto, Error, Operation, Receiver};

use crate::detach_pool::spawn_detached_pooled;

pub fn merge_each<A, B>(left: A, right: B) -> MergeSender<A, B>
where
    A: SequenceSender<Error = Error>,
    B: SequenceSender<Item = A::Item, Error = Error>,
{
    MergeSender { left, right }
}

pub struct MergeSender<A, B> {
    left: A,
    right: B,
}

impl<A, B> SequenceSender for MergeSender<A, B>
where
    A: SequenceSender<Error = Error> + Send + 'static,
    B: SequenceSender<Item = A::Item, Error = Error> + Send + 'static,
    A::Item: Send + 'static,
{
    type Item = A::Item;
    type Error = Error;
    type Operation<R>
        = MergeOperation<A, B, R>
    where
        R: SequenceReceiver<Item = A::Item, Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<DispatchedReceiver<A::Item, R>>;

    fn cardinality(&self) -> Cardinality {
        match (self.left.cardinality(), self.right.cardinality()) {
            (Cardinality::Finite(a), Cardinality::Finite(b)) => Cardinality::Finite(a + b),
            _ => Cardinality::Unbounded,
        }
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism::Concurrent { limit: None }
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = A::Item, Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<DispatchedReceiver<A::Item, R>>,
    {
        MergeOperation {
            left: Some(self.left),
            right: Some(self.right),
            core: Arc::new(MergeCore {
                queue: Mutex::new(VecDeque::new()),
                busy: AtomicBool::new(false),
                receiver: Mutex::new(Some(receiver)),
                // Two sides' own production completions, held open until
                // both have finished producing.
                outstanding_sides: AtomicUsize::new(2),
                error: Mutex::new(None),
            }),
        }
    }
}

struct PendingItem<T> {
    item: T,
    ack: Box<dyn FnOnce() + Send>,
}

struct MergeCore<T, R> {
    queue: Mutex<VecDeque<PendingItem<T>>>,
    busy: AtomicBool,
    receiver: Mutex<Option<R>>,
    outstanding_sides: AtomicUsize,
    error: Mutex<Option<Error>>,
}

impl<T, R> MergeCore<T, R>
where
    T: Send + 'static,
    R: SequenceReceiver<Item = T, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<DispatchedReceiver<T, R>>,
{
    fn offer(self: &Arc<Self>, item: T, ack: Box<dyn FnOnce() + Send>) {
        self.queue.lock().unwrap().push_back(PendingItem { item, ack });
        self.pump();
    }

    fn pump(self: &Arc<Self>) {
        if self.busy.swap(true, Ordering::AcqRel) {
            return;
        }
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            None => {
                self.busy.store(false, Ordering::Release);
            }
            Some(PendingItem { item, ack }) => {
                let next_sender = {
                    let guard = self.receiver.lock().unwrap();
                    guard
                        .as_ref()
                        .expect("item dispatched after completion")
                        .set_next(item)
                };
                spawn_detached_pooled(
                    next_sender,
                    DispatchedReceiver {
                        core: self.clone(),
                        ack: Some(ack),
                    },
                );
            }
        }
    }

    fn record_error(&self, error: Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn side_finished(self: &Arc<Self>) {
        if self.outstanding_sides.fetch_sub(1, Ordering::AcqRel) == 1 {
            let receiver = self
                .receiver
                .lock()
                .unwrap()
                .take()
                .expect("merge finished twice");
            match self.error.lock().unwrap().take() {
                Some(error) => receiver.set_error(error),
                None => receiver.set_value(()),
            }
        }
    }
}

pub struct DispatchedReceiver<T, R> {
    core: Arc<MergeCore<T, R>>,
    ack: Option<Box<dyn FnOnce() + Send>>,
}

impl<T, R> Receiver for DispatchedReceiver<T, R>
where
    T: Send + 'static,
    R: SequenceReceiver<Item = T, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<DispatchedReceiver<T, R>>,
{
    type Value = ();
    type Error = Error;
    fn set_value(mut self, _: ()) {
        (self.ack.take().expect("acked once"))();
        self.core.busy.store(false, Ordering::Release);
        self.core.pump();
    }
    fn set_error(mut self, error: Error) {
        self.core.record_error(error);
        (self.ack.take().expect("acked once"))();
        self.core.busy.store(false, Ordering::Release);
        self.core.pump();
    }
    fn set_stopped(mut self) {
        (self.ack.take().expect("acked once"))();
        self.core.busy.store(false, Ordering::Release);
        self.core.pump();
    }
}

pub struct MergeOperation<A, B, R>
where
    A: SequenceSender,
{
    left: Option<A>,
    right: Option<B>,
    core: Arc<MergeCore<A::Item, R>>,
}

impl<A, B, R> Operation for MergeOperation<A, B, R>
where
    A: SequenceSender<Error = Error> + Send + 'static,
    B: SequenceSender<Item = A::Item, Error = Error> + Send + 'static,
    A::Item: Send + 'static,
    R: SequenceReceiver<Item = A::Item, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<DispatchedReceiver<A::Item, R>>,
{
    fn start(mut self: Pin<&mut Self>) {
        let left = self.left.take().expect("start called twice");
        let right = self.right.take().expect("start called twice");
        drive_forever(left.connect(MergeSideReceiver {
            core: self.core.clone(),
        }));
        drive_forever(right.connect(MergeSideReceiver {
            core: self.core.clone(),
        }));
    }
}

fn drive_forever(op: impl Operation + 'static) {
    let boxed: Pin<Box<dyn Operation>> = Box::pin(op);
    // SAFETY: immediately leaked, so the pinned data never moves again.
    let leaked_box = unsafe { Pin::into_inner_unchecked(boxed) };
    let leaked: &'static mut dyn Operation = Box::leak(leaked_box);
    unsafe { Pin::new_unchecked(leaked) }.start();
}

struct MergeSideReceiver<T, R> {
    core: Arc<MergeCore<T, R>>,
}

impl<T, R> Receiver for MergeSideReceiver<T, R>
where
    T: Send + 'static,
    R: SequenceReceiver<Item = T, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<DispatchedReceiver<T, R>>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.core.side_finished();
    }
    fn set_error(self, error: Error) {
        self.core.record_error(error);
        self.core.side_finished();
    }
    fn set_stopped(self) {
        self.core.side_finished();
    }
}

impl<T, R> SequenceReceiver for MergeSideReceiver<T, R>
where
    T: Send + 'static,
    R: SequenceReceiver<Item = T, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<DispatchedReceiver<T, R>>,
{
    type Item = T;
    type NextSender = JustSender<(), Error>;

    fn set_next(&self, item: T) -> Self::NextSender {
        let cell = OneShotCell::new();
        let cell_for_ack = cell.clone();
        self.core.offer(item, Box::new(move || cell_for_ack.fire()));
        OneShotSender { cell }
    }
}

/// Completes once, whichever of "started" or "fired" happens second —
/// the same shape as `zip`'s `AckCell`, duplicated here to keep the two
/// combinators independently readable.
struct OneShotCell {
    state: Mutex<OneShotState>,
}

enum OneShotState {
    Pending,
    Started(Box<dyn FnOnce() + Send>),
    Fired,
}

impl OneShotCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OneShotState::Pending),
        })
    }

    fn on_start(&self, complete: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, OneShotState::Fired) {
            OneShotState::Pending => *state = OneShotState::Started(Box::new(complete)),
            OneShotState::Fired => {
                drop(state);
                complete();
            }
            OneShotState::Started(_) => unreachable!("started twice"),
        }
    }

    fn fire(&self) {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, OneShotState::Fired) {
            OneShotState::Pending => {}
            OneShotState::Started(complete) => {
                drop(state);
                complete();
            }
            OneShotState::Fired => unreachable!("fired twice"),
        }
    }
}

struct OneShotSender {
    cell: Arc<OneShotCell>,
}

struct OneShotOperation<R> {
    cell: Arc<OneShotCell>,
    receiver: Option<R>,
}

impl fern_core::Sender for OneShotSender {
    type Value = ();
    type Error = Error;
    type Operation<C>
        = OneShotOperation<C>
    where
        C: Receiver<Value = (), Error = Error>;

    fn connect<C>(self, receiver: C) -> Self::Operation<C>
    where
        C: Receiver<Value = (), Error = Error>,
    {
        OneShotOperation {
            cell: self.cell,
            receiver: Some(receiver),
        }
    }
}

impl<R> Operation for OneShotOperation<R>
where
    R: Receiver<Value = (), Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        self.cell.on_start(move || receiver.set_value(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::iterate;
    use std::pin::pin;
    use std::sync::mpsc;

    struct CollectReceiver {
        seen: Arc<Mutex<Vec<u32>>>,
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
        type Item = u32;
        type NextSender = JustSender<(), Error>;
        fn set_next(&self, item: u32) -> Self::NextSender {
            self.seen.lock().unwrap().push(item);
            JustSender::new(())
        }
    }

    #[test]
    fn merge_each_delivers_every_item_from_both_sides() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let receiver = CollectReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let seq = merge_each(iterate(0..3u32), iterate(10..13u32));
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 10, 11, 12]);
    }
}
