//! `zip(left, right)`: pairs up the k-th item of each input into one tuple
//! item, delivered only once both sides have produced their k-th item.
//! Stops as soon as the shorter input finishes. N-ary zip is expressed by
//! nesting — `zip(zip(a, b), c)` reshaped by a `then_each` that flattens the
//! nested tuple — the same way idiomatic Rust iterator zips compose.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
use fern_core::{DetachableInto, Error, Operation, Receiver};

use crate::detach_pool::spawn_detached_pooled;

pub fn zip<A, B>(left: A, right: B) -> ZipSender<A, B>
where
    A: SequenceSender<Error = Error>,
    B: SequenceSender<Error = Error>,
{
    ZipSender { left, right }
}

pub struct ZipSender<A, B> {
    left: A,
    right: B,
}

impl<A, B> SequenceSender for ZipSender<A, B>
where
    A: SequenceSender<Error = Error> + Send + 'static,
    B: SequenceSender<Error = Error> + Send + 'static,
    A::Item: Send + 'static,
    B::Item: Send + 'static,
{
    type Item = (A::Item, B::Item);
    type Error = Error;
    type Operation<R>
        = ZipOperation<A, B, R>
    where
        R: SequenceReceiver<Item = (A::Item, B::Item), Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<ZipPairReceiver>;

    fn cardinality(&self) -> Cardinality {
        match (self.left.cardinality(), self.right.cardinality()) {
            (Cardinality::Finite(a), Cardinality::Finite(b)) => Cardinality::Finite(a.min(b)),
            _ => Cardinality::Unbounded,
        }
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism::LockStep
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = (A::Item, B::Item), Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<ZipPairReceiver>,
    {
        ZipOperation {
            left: Some(self.left),
            right: Some(self.right),
            core: Arc::new(ZipCore {
                state: Mutex::new(ZipState {
                    pending_left: None,
                    pending_right: None,
                    receiver: Some(receiver),
                }),
                finished: AtomicBool::new(false),
            }),
        }
    }
}

/// Fires exactly once, either before or after the next-sender it belongs to
/// has been `start`ed; whichever happens second performs the completion.
struct AckCell {
    state: Mutex<AckState>,
}

enum AckState {
    PendingStart,
    Started(Box<dyn FnOnce() + Send>),
    Fired,
}

impl AckCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AckState::PendingStart),
        })
    }

    fn on_start(&self, complete: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, AckState::Fired) {
            AckState::PendingStart => *state = AckState::Started(Box::new(complete)),
            AckState::Fired => {
                drop(state);
                complete();
            }
            AckState::Started(_) => unreachable!("next-sender started twice"),
        }
    }

    fn fire(&self) {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, AckState::Fired) {
            AckState::PendingStart => {}
            AckState::Started(complete) => {
                drop(state);
                complete();
            }
            AckState::Fired => unreachable!("fired twice"),
        }
    }
}

/// The next-sender handed back to whichever side's driver called `set_next`.
/// Completes once the paired tuple's downstream body finishes.
pub struct AckSender {
    cell: Arc<AckCell>,
}

pub struct AckOperation<R> {
    cell: Arc<AckCell>,
    receiver: Option<R>,
}

impl fern_core::Sender for AckSender {
    type Value = ();
    type Error = Error;
    type Operation<C>
        = AckOperation<C>
    where
        C: Receiver<Value = (), Error = Error>;

    fn connect<C>(self, receiver: C) -> Self::Operation<C>
    where
        C: Receiver<Value = (), Error = Error>,
    {
        AckOperation {
            cell: self.cell,
            receiver: Some(receiver),
        }
    }
}

impl<R> Operation for AckOperation<R>
where
    R: Receiver<Value = (), Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        self.cell.on_start(move || receiver.set_value(()));
    }
}

type PendingAck = Arc<AckCell>;

struct ZipState<A, B, R> {
    pending_left: Option<(A, PendingAck)>,
    pending_right: Option<(B, PendingAck)>,
    receiver: Option<R>,
}

struct ZipCore<A, B, R> {
    state: Mutex<ZipState<A, B, R>>,
    finished: AtomicBool,
}

impl<A, B, R> ZipCore<A, B, R>
where
    A: Send + 'static,
    B: Send + 'static,
    R: SequenceReceiver<Item = (A, B), Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<ZipPairReceiver>,
{
    fn offer_left(self: &Arc<Self>, item: A, ack: PendingAck) {
        let paired = {
            let mut guard = self.state.lock().unwrap();
            match guard.pending_right.take() {
                Some((right, right_ack)) => Some((item, ack, right, right_ack)),
                None => {
                    guard.pending_left = Some((item, ack));
                    None
                }
            }
        };
        if let Some((left, left_ack, right, right_ack)) = paired {
            self.emit(left, right, left_ack, right_ack);
        }
    }

    fn offer_right(self: &Arc<Self>, item: B, ack: PendingAck) {
        let paired = {
            let mut guard = self.state.lock().unwrap();
            match guard.pending_left.take() {
                Some((left, left_ack)) => Some((left, left_ack, item, ack)),
                None => {
                    guard.pending_right = Some((item, ack));
                    None
                }
            }
        };
        if let Some((left, left_ack, right, right_ack)) = paired {
            self.emit(left, right, left_ack, right_ack);
        }
    }

    fn emit(self: &Arc<Self>, left: A, right: B, left_ack: PendingAck, right_ack: PendingAck) {
        let next = {
            let guard = self.state.lock().unwrap();
            guard
                .receiver
                .as_ref()
                .expect("item paired after completion")
                .set_next((left, right))
        };
        spawn_detached_pooled(next, ZipPairReceiver { left_ack, right_ack });
    }

    fn finish(self: &Arc<Self>, outcome: ZipOutcome) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let receiver = self
            .state
            .lock()
            .unwrap()
            .receiver
            .take()
            .expect("finished twice");
        match outcome {
            ZipOutcome::Value => receiver.set_value(()),
            ZipOutcome::Error(error) => receiver.set_error(error),
            ZipOutcome::Stopped => receiver.set_stopped(),
        }
    }
}

enum ZipOutcome {
    Value,
    Error(Error),
    Stopped,
}

pub struct ZipPairReceiver {
    left_ack: PendingAck,
    right_ack: PendingAck,
}

impl Receiver for ZipPairReceiver {
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.left_ack.fire();
        self.right_ack.fire();
    }
    fn set_error(self, _: Error) {
        // The tuple body's own error does not reach either side's producer
        // directly; each side observes only its own producer's outcome.
        // Firing both acks lets each driver unwind instead of stalling.
        self.left_ack.fire();
        self.right_ack.fire();
    }
    fn set_stopped(self) {
        self.left_ack.fire();
        self.right_ack.fire();
    }
}

pub struct ZipOperation<A, B, R>
where
    A: SequenceSender,
    B: SequenceSender,
{
    left: Option<A>,
    right: Option<B>,
    core: Arc<ZipCore<A::Item, B::Item, R>>,
}

impl<A, B, R> Operation for ZipOperation<A, B, R>
where
    A: SequenceSender<Error = Error> + Send + 'static,
    B: SequenceSender<Error = Error> + Send + 'static,
    A::Item: Send + 'static,
    B::Item: Send + 'static,
    R: SequenceReceiver<Item = (A::Item, B::Item), Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<ZipPairReceiver>,
{
    fn start(mut self: Pin<&mut Self>) {
        let left = self.left.take().expect("start called twice");
        let right = self.right.take().expect("start called twice");
        drive_forever(left.connect(ZipLeftReceiver {
            core: self.core.clone(),
        }));
        drive_forever(right.connect(ZipRightReceiver {
            core: self.core.clone(),
        }));
    }
}

/// Starts a self-contained driving operation that reports its outcome
/// entirely through shared state (here, the [`ZipCore`]) rather than through
/// any receiver a caller holds onto. There is nothing to reclaim it later,
/// so — unlike [`fern_core::spawn_detached`], which frees its holder on completion —
/// this leaks the boxed operation for the life of the process.
fn drive_forever(op: impl Operation + 'static) {
    let boxed: Pin<Box<dyn Operation>> = Box::pin(op);
    // SAFETY: the box is immediately leaked, so the pinned data never moves
    // or is dropped while `start` (and whatever it schedules) runs.
    let leaked_box = unsafe { Pin::into_inner_unchecked(boxed) };
    let leaked: &'static mut dyn Operation = Box::leak(leaked_box);
    unsafe { Pin::new_unchecked(leaked) }.start();
}

struct ZipLeftReceiver<A, B, R> {
    core: Arc<ZipCore<A, B, R>>,
}

impl<A, B, R> Receiver for ZipLeftReceiver<A, B, R>
where
    A: Send + 'static,
    B: Send + 'static,
    R: SequenceReceiver<Item = (A, B), Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<ZipPairReceiver>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.core.finish(ZipOutcome::Value);
    }
    fn set_error(self, error: Error) {
        self.core.finish(ZipOutcome::Error(error));
    }
    fn set_stopped(self) {
        self.core.finish(ZipOutcome::Stopped);
    }
}

impl<A, B, R> SequenceReceiver for ZipLeftReceiver<A, B, R>
where
    A: Send + 'static,
    B: Send + 'static,
    R: SequenceReceiver<Item = (A, B), Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<ZipPairReceiver>,
{
    type Item = A;
    type NextSender = AckSender;

    fn set_next(&self, item: A) -> Self::NextSender {
        let cell = AckCell::new();
        self.core.offer_left(item, cell.clone());
        AckSender { cell }
    }
}

struct ZipRightReceiver<A, B, R> {
    core: Arc<ZipCore<A, B, R>>,
}

impl<A, B, R> Receiver for ZipRightReceiver<A, B, R>
where
    A: Send + 'static,
    B: Send + 'static,
    R: SequenceReceiver<Item = (A, B), Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<ZipPairReceiver>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.core.finish(ZipOutcome::Value);
    }
    fn set_error(self, error: Error) {
        self.core.finish(ZipOutcome::Error(error));
    }
    fn set_stopped(self) {
        self.core.finish(ZipOutcome::Stopped);
    }
}

impl<A, B, R> SequenceReceiver for ZipRightReceiver<A, B, R>
where
    A: Send + 'static,
    B: Send + 'static,
    R: SequenceReceiver<Item = (A, B), Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<ZipPairReceiver>,
{
    type Item = B;
    type NextSender = AckSender;

    fn set_next(&self, item: B) -> Self::NextSender {
        let cell = AckCell::new();
        self.core.offer_right(item, cell.clone());
        AckSender { cell }
    }
}
