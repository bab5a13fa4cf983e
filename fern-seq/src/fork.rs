//! `fork`: request concurrent starts of item bodies instead of waiting for
//! each one to finish before asking the producer for the next item.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::cancel::StopSource;
use fern_core::sender::JustSender;
use fern_core::sequence::{Cardinality, Parallelism, SequenceReceiver, SequenceSender};
use fern_core::{DetachableInto, Error, Receiver};

use crate::detach_pool::spawn_detached_pooled;

/// Fork item production: `seq`'s items are pulled without waiting on the
/// previous item's downstream body, which runs detached. Order of *starts*
/// matches `seq`'s production order; order of *completions* does not.
pub fn fork<S>(seq: S) -> ForkSender<S>
where
    S: SequenceSender<Error = Error>,
{
    ForkSender { seq }
}

pub struct ForkSender<S> {
    seq: S,
}

impl<S> SequenceSender for ForkSender<S>
where
    S: SequenceSender<Error = Error>,
    S::Item: Send + 'static,
{
    type Item = S::Item;
    type Error = Error;
    type Operation<R>
        = S::Operation<ForkReceiver<R>>
    where
        R: SequenceReceiver<Item = S::Item, Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<ForkBodyReceiver<R>>;

    fn cardinality(&self) -> Cardinality {
        self.seq.cardinality()
    }

    fn parallelism(&self) -> Parallelism {
        Parallelism::Concurrent { limit: None }
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = S::Item, Error = Error, Value = ()> + Send + 'static,
        R::NextSender: DetachableInto<ForkBodyReceiver<R>>,
    {
        let state = Arc::new(ForkState {
            receiver: Mutex::new(Some(receiver)),
            // Held open until `seq`'s own production completes, so a burst
            // of synchronously-completing items can't drive outstanding to
            // zero before the producer has even finished handing them out.
            outstanding: AtomicUsize::new(1),
            error: Mutex::new(None),
            stop_source: StopSource::new(),
        });
        self.seq.connect(ForkReceiver { state })
    }
}

struct ForkState<R> {
    receiver: Mutex<Option<R>>,
    outstanding: AtomicUsize,
    error: Mutex<Option<Error>>,
    // Requested on first error so an item body written to observe it (e.g.
    // via an adaptor installed with `transform_each`) can cut its work
    // short; the struct itself does not force in-flight bodies to stop.
    stop_source: StopSource,
}

impl<R> ForkState<R>
where
    R: Receiver<Value = (), Error = Error>,
{
    fn record_error(&self, error: Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
            self.stop_source.request_stop();
        }
    }

    fn item_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let receiver = self
                .receiver
                .lock()
                .unwrap()
                .take()
                .expect("fork state finished twice");
            match self.error.lock().unwrap().take() {
                Some(error) => receiver.set_error(error),
                None => receiver.set_value(()),
            }
        }
    }
}

pub struct ForkReceiver<R> {
    state: Arc<ForkState<R>>,
}

impl<R> Receiver for ForkReceiver<R>
where
    R: Receiver<Value = (), Error = Error>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.state.item_finished();
    }
    fn set_error(self, error: Error) {
        self.state.record_error(error);
        self.state.item_finished();
    }
    fn set_stopped(self) {
        self.state.item_finished();
    }
}

impl<R> SequenceReceiver for ForkReceiver<R>
where
    R: SequenceReceiver<Error = Error, Value = ()>,
    R::NextSender: DetachableInto<ForkBodyReceiver<R>>,
{
    type Item = R::Item;
    type NextSender = JustSender<(), Error>;

    fn set_next(&self, item: R::Item) -> Self::NextSender {
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        let body = {
            let guard = self.state.receiver.lock().unwrap();
            guard
                .as_ref()
                .expect("set_next called after completion")
                .set_next(item)
        };
        spawn_detached_pooled(
            body,
            ForkBodyReceiver {
                state: self.state.clone(),
            },
        );
        JustSender::new(())
    }
}

pub struct ForkBodyReceiver<R> {
    state: Arc<ForkState<R>>,
}

impl<R> Receiver for ForkBodyReceiver<R>
where
    R: Receiver<Value = (), Error = Error>,
{
    type Value = ();
    type Error = Error;
    fn set_value(self, _: ()) {
        self.state.item_finished();
    }
    fn set_error(self, error: Error) {
        self.state.record_error(error);
        self.state.item_finished();
    }
    fn set_stopped(self) {
        self.state.item_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::iterate;
    use fern_core::sender::JustSender as Just;
    use std::pin::pin;
    use std::sync::mpsc;

    struct CountingReceiver {
        seen: Arc<Mutex<Vec<u32>>>,
        done: mpsc::Sender<Result<(), Error>>,
    }

    impl Receiver for CountingReceiver {
        type Value = ();
        type Error = Error;
        fn set_value(self, _: ()) {
            self.done.send(Ok(())).unwrap();
        }
        fn set_error(self, error: Error) {
            self.done.send(Err(error)).unwrap();
        }
        fn set_stopped(self) {
            panic!("unexpected stop");
        }
    }

    impl SequenceReceiver for CountingReceiver {
        type Item = u32;
        type NextSender = Just<(), Error>;
        fn set_next(&self, item: u32) -> Self::NextSender {
            self.seen.lock().unwrap().push(item);
            Just::new(())
        }
    }

    #[test]
    fn fork_delivers_every_item_and_completes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let receiver = CountingReceiver {
            seen: seen.clone(),
            done: tx,
        };
        let seq = fork(iterate(0..10u32));
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap(),
            Ok(())
        );
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..10u32).collect::<Vec<_>>());
    }
}
