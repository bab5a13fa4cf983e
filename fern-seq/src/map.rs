//! Per-item item-value and item-sender transforms: `then_each`,
//! `let_value_each`, `transform_each`.

use std::sync::Arc;

use fern_core::sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
use fern_core::{spawn_detached, DetachableInto, Error, Receiver, Sender};

/// Maps each item through a pure function. Cardinality and parallelism are
/// inherited unchanged from `seq` since neither the item count nor the
/// scheduling of downstream work is affected.
pub fn then_each<S, F, B>(seq: S, f: F) -> ThenEachSender<S, F>
where
    S: SequenceSender<Error = Error>,
    F: Fn(S::Item) -> B + Send + 'static,
{
    ThenEachSender { seq, f }
}

pub struct ThenEachSender<S, F> {
    seq: S,
    f: F,
}

impl<S, F, B> SequenceSender for ThenEachSender<S, F>
where
    S: SequenceSender<Error = Error>,
    F: Fn(S::Item) -> B + Send + 'static,
    B: Send + 'static,
{
    type Item = B;
    type Error = Error;
    type Operation<R>
        = S::Operation<ThenEachReceiver<R, F>>
    where
        R: SequenceReceiver<Item = B, Error = Error, Value = ()>;

    fn cardinality(&self) -> Cardinality {
        self.seq.cardinality()
    }

    fn parallelism(&self) -> Parallelism {
        self.seq.parallelism()
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = B, Error = Error, Value = ()>,
    {
        self.seq.connect(ThenEachReceiver {
            receiver,
            f: self.f,
        })
    }
}

pub struct ThenEachReceiver<R, F> {
    receiver: R,
    f: F,
}

impl<R, F> Receiver for ThenEachReceiver<R, F>
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

impl<R, F, A, B> SequenceReceiver for ThenEachReceiver<R, F>
where
    R: SequenceReceiver<Item = B>,
    F: Fn(A) -> B,
{
    type Item = A;
    type NextSender = R::NextSender;
    fn set_next(&self, item: A) -> Self::NextSender {
        self.receiver.set_next((self.f)(item))
    }
}

/// Pipes each item's next-sender through a sender adaptor, leaving the item
/// value and sequence shape untouched. Does not know or care what the item
/// type is, which is what makes it the primitive the value-changing
/// combinators (`then_each`, `let_value_each`) are not built from but sit
/// alongside: those change *what* item flows, this changes *how* its
/// next-sender runs (timeouts, tracing, cancellation scoping, ...).
pub fn transform_each<S, Ad>(seq: S, adaptor: Ad) -> TransformEachSender<S, Ad>
where
    S: SequenceSender<Error = Error>,
{
    TransformEachSender { seq, adaptor }
}

pub struct TransformEachSender<S, Ad> {
    seq: S,
    adaptor: Ad,
}

impl<S, Ad, NS> SequenceSender for TransformEachSender<S, Ad>
where
    S: SequenceSender<Error = Error>,
    Ad: Send + 'static,
{
    type Item = S::Item;
    type Error = Error;
    type Operation<R>
        = S::Operation<TransformEachReceiver<R, Ad>>
    where
        R: SequenceReceiver<Item = S::Item, Error = Error, Value = ()>,
        Ad: Fn(R::NextSender) -> NS,
        NS: Sender<Value = (), Error = Error>;

    fn cardinality(&self) -> Cardinality {
        self.seq.cardinality()
    }

    fn parallelism(&self) -> Parallelism {
        self.seq.parallelism()
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = S::Item, Error = Error, Value = ()>,
        Ad: Fn(R::NextSender) -> NS,
        NS: Sender<Value = (), Error = Error>,
    {
        self.seq.connect(TransformEachReceiver {
            receiver,
            adaptor: self.adaptor,
        })
    }
}

pub struct TransformEachReceiver<R, Ad> {
    receiver: R,
    adaptor: Ad,
}

impl<R, Ad> Receiver for TransformEachReceiver<R, Ad>
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

impl<R, Ad, NS> SequenceReceiver for TransformEachReceiver<R, Ad>
where
    R: SequenceReceiver,
    Ad: Fn(R::NextSender) -> NS,
    NS: Sender<Value = (), Error = R::Error>,
{
    type Item = R::Item;
    type NextSender = NS;
    fn set_next(&self, item: R::Item) -> NS {
        (self.adaptor)(self.receiver.set_next(item))
    }
}

/// Maps each item through a sender-returning function and flattens: the
/// item delivered downstream is the *value* the per-item sender completes
/// with, not the sender itself. Can change the item type.
pub fn let_value_each<S, F>(seq: S, f: F) -> LetValueEachSender<S, F>
where
    S: SequenceSender<Error = Error>,
{
    LetValueEachSender { seq, f }
}

pub struct LetValueEachSender<S, F> {
    seq: S,
    f: F,
}

impl<S, F, FS> SequenceSender for LetValueEachSender<S, F>
where
    S: SequenceSender<Error = Error>,
    F: Fn(S::Item) -> FS + Send + 'static,
    FS: Sender<Error = Error> + Send + 'static,
    FS::Value: Send + 'static,
{
    type Item = FS::Value;
    type Error = Error;
    type Operation<R>
        = S::Operation<LetValueEachReceiver<R, F>>
    where
        R: SequenceReceiver<Item = FS::Value, Error = Error, Value = ()>;

    fn cardinality(&self) -> Cardinality {
        self.seq.cardinality()
    }

    fn parallelism(&self) -> Parallelism {
        self.seq.parallelism()
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = FS::Value, Error = Error, Value = ()>,
    {
        self.seq.connect(LetValueEachReceiver {
            receiver: Arc::new(receiver),
            f: self.f,
        })
    }
}

pub struct LetValueEachReceiver<R, F> {
    receiver: Arc<R>,
    f: F,
}

impl<R, F> Receiver for LetValueEachReceiver<R, F>
where
    R: Receiver,
{
    type Value = R::Value;
    type Error = R::Error;
    fn set_value(self, value: Self::Value) {
        Arc::try_unwrap(self.receiver)
            .unwrap_or_else(|_| panic!("item senders still outstanding at sequence completion"))
            .set_value(value);
    }
    fn set_error(self, error: Self::Error) {
        Arc::try_unwrap(self.receiver)
            .unwrap_or_else(|_| panic!("item senders still outstanding at sequence completion"))
            .set_error(error);
    }
    fn set_stopped(self) {
        Arc::try_unwrap(self.receiver)
            .unwrap_or_else(|_| panic!("item senders still outstanding at sequence completion"))
            .set_stopped();
    }
}

impl<R, F, A, FS> SequenceReceiver for LetValueEachReceiver<R, F>
where
    R: SequenceReceiver<Item = FS::Value, Error = Error, Value = ()> + Send + Sync + 'static,
    F: Fn(A) -> FS,
    FS: Sender<Error = Error> + Send + 'static,
{
    type Item = A;
    type NextSender = LetValueEachNextSender<FS, R>;
    fn set_next(&self, item: A) -> Self::NextSender {
        LetValueEachNextSender {
            item_sender: (self.f)(item),
            receiver: self.receiver.clone(),
        }
    }
}

pub struct LetValueEachNextSender<FS, R> {
    item_sender: FS,
    receiver: Arc<R>,
}

impl<FS, R> Sender for LetValueEachNextSender<FS, R>
where
    R: SequenceReceiver<Error = Error, Value = ()> + Send + Sync + 'static,
    FS: Sender<Value = R::Item, Error = Error> + Send + 'static,
{
    type Value = ();
    type Error = Error;
    type Operation<C>
        = LetValueEachOperation<FS, R, C>
    where
        C: Receiver<Value = (), Error = Error> + Send + 'static,
        FS: DetachableInto<FlattenValueReceiver<R, C>>,
        R::NextSender: DetachableInto<ForwardReceiver<C>>;

    fn connect<C>(self, receiver: C) -> Self::Operation<C>
    where
        C: Receiver<Value = (), Error = Error> + Send + 'static,
        FS: DetachableInto<FlattenValueReceiver<R, C>>,
        R::NextSender: DetachableInto<ForwardReceiver<C>>,
    {
        LetValueEachOperation {
            item_sender: Some(self.item_sender),
            inner: Some(self.receiver),
            outer: Some(receiver),
        }
    }
}

pub struct LetValueEachOperation<FS, R, C> {
    item_sender: Option<FS>,
    inner: Option<Arc<R>>,
    outer: Option<C>,
}

impl<FS, R, C> fern_core::Operation for LetValueEachOperation<FS, R, C>
where
    R: SequenceReceiver<Error = Error, Value = ()> + Send + Sync + 'static,
    FS: Sender<Value = R::Item, Error = Error> + Send + 'static,
    C: Receiver<Value = (), Error = Error> + Send + 'static,
    FS: DetachableInto<FlattenValueReceiver<R, C>>,
    R::NextSender: DetachableInto<ForwardReceiver<C>>,
{
    fn start(mut self: std::pin::Pin<&mut Self>) {
        let item_sender = self.item_sender.take().expect("start called twice");
        let inner = self.inner.take().expect("start called twice");
        let outer = self.outer.take().expect("start called twice");
        spawn_detached(item_sender, FlattenValueReceiver { inner, outer });
    }
}

/// Receives the value a per-item sender-returning body completed with, then
/// forwards it into the downstream sequence receiver's `set_next` and waits
/// for that to finish before the whole item-sender reports done.
pub struct FlattenValueReceiver<R, C>
where
    R: SequenceReceiver,
{
    inner: Arc<R>,
    outer: C,
}

impl<R, C> Receiver for FlattenValueReceiver<R, C>
where
    R: SequenceReceiver<Error = Error, Value = ()> + Send + Sync + 'static,
    C: Receiver<Value = (), Error = Error> + Send + 'static,
    R::NextSender: DetachableInto<ForwardReceiver<C>>,
{
    type Value = R::Item;
    type Error = Error;
    fn set_value(self, item: R::Item) {
        let next = self.inner.set_next(item);
        spawn_detached(next, ForwardReceiver { outer: self.outer });
    }
    fn set_error(self, error: Error) {
        self.outer.set_error(error);
    }
    fn set_stopped(self) {
        self.outer.set_stopped();
    }
}

pub struct ForwardReceiver<C> {
    outer: C,
}

impl<C> Receiver for ForwardReceiver<C>
where
    C: Receiver<Value = (), Error = Error>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, value: ()) {
        self.outer.set_value(value);
    }
    fn set_error(self, error: Error) {
        self.outer.set_error(error);
    }
    fn set_stopped(self) {
        self.outer.set_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::iterate;
    use fern_core::sender::JustSender;
    use std::pin::pin;
    use std::sync::Mutex as StdMutex;

    struct CollectReceiver<T> {
        seen: Arc<StdMutex<Vec<T>>>,
        done: std::sync::mpsc::Sender<()>,
    }

    impl<T> Receiver for CollectReceiver<T> {
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

    impl<T> SequenceReceiver for CollectReceiver<T> {
        type Item = T;
        type NextSender = JustSender<(), Error>;
        fn set_next(&self, item: T) -> Self::NextSender {
            self.seen.lock().unwrap().push(item);
            JustSender::new(())
        }
    }

    #[test]
    fn then_each_maps_every_item() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        let receiver = CollectReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let seq = then_each(iterate(0..5u32), |n| n * 10);
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn transform_each_wraps_every_next_sender() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        let receiver = CollectReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let calls2 = calls.clone();
        let seq = transform_each(iterate(0..3u32), move |next: JustSender<(), Error>| {
            calls2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            next
        });
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[test]
    fn let_value_each_flattens_sender_results() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        let receiver = CollectReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let seq = let_value_each(iterate(0..4u32), |n| JustSender::<u32, Error>::new(n * n));
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 4, 9]);
    }
}
