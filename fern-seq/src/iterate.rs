//! `iterate(range)`: emit each element of an iterator as a sequence item.
//!
//! Driving is trampolined rather than recursive: a synchronously-completing
//! `set_next` would otherwise grow the stack by one frame per item, turning a
//! long in-memory range into a stack overflow. The `running`/`pending` pair
//! on [`Driver`] makes whichever call frame is already driving the loop pick
//! up the next item instead of letting a reentrant completion recurse into
//! it.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::sequence::{Cardinality, SequenceReceiver, SequenceSender};
use fern_core::{spawn_detached, DetachableInto, Error, Operation, Receiver};

pub fn iterate<I>(items: I) -> IterateSender<I::IntoIter>
where
    I: IntoIterator,
{
    IterateSender {
        iter: items.into_iter(),
    }
}

pub struct IterateSender<It> {
    iter: It,
}

impl<It> SequenceSender for IterateSender<It>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
{
    type Item = It::Item;
    type Error = Error;
    type Operation<R>
        = IterateOperation<It, R>
    where
        R: SequenceReceiver<Item = It::Item, Error = Error, Value = ()>,
        R::NextSender: DetachableInto<AdvanceReceiver<It, R>>;

    fn cardinality(&self) -> Cardinality {
        match self.iter.size_hint() {
            (lo, Some(hi)) if lo == hi => Cardinality::Finite(lo),
            _ => Cardinality::Unbounded,
        }
    }

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = It::Item, Error = Error, Value = ()>,
        R::NextSender: DetachableInto<AdvanceReceiver<It, R>>,
    {
        IterateOperation {
            iter: Some(self.iter),
            receiver: Some(receiver),
        }
    }
}

pub struct IterateOperation<It, R> {
    iter: Option<It>,
    receiver: Option<R>,
}

struct Driver<It, R> {
    iter: Mutex<It>,
    receiver: Mutex<Option<R>>,
    running: AtomicBool,
    pending: AtomicBool,
}

impl<It, R> Operation for IterateOperation<It, R>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
    R: SequenceReceiver<Item = It::Item, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<It, R>>,
{
    fn start(mut self: Pin<&mut Self>) {
        let iter = self.iter.take().expect("start called twice");
        let receiver = self.receiver.take().expect("start called twice");
        let driver = Arc::new(Driver {
            iter: Mutex::new(iter),
            receiver: Mutex::new(Some(receiver)),
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        });
        advance(driver);
    }
}

/// Drive `driver` forward one or more items. Returns once either the
/// sequence has finished or ownership of the loop has been handed off to a
/// completion that will fire later (an async item's `set_next`).
fn advance<It, R>(driver: Arc<Driver<It, R>>)
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
    R: SequenceReceiver<Item = It::Item, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<It, R>>,
{
    if driver.running.swap(true, Ordering::AcqRel) {
        // Someone further down the stack is already driving; tell it to
        // keep going instead of recursing into the next item from here.
        driver.pending.store(true, Ordering::Release);
        return;
    }
    loop {
        let next = driver.iter.lock().unwrap().next();
        match next {
            None => {
                driver.running.store(false, Ordering::Release);
                if let Some(receiver) = driver.receiver.lock().unwrap().take() {
                    receiver.set_value(());
                }
                return;
            }
            Some(item) => {
                let next_sender = {
                    let guard = driver.receiver.lock().unwrap();
                    guard
                        .as_ref()
                        .expect("receiver already consumed")
                        .set_next(item)
                };
                driver.pending.store(false, Ordering::Release);
                spawn_detached(
                    next_sender,
                    AdvanceReceiver {
                        driver: driver.clone(),
                    },
                );
                if !driver.pending.load(Ordering::Acquire) {
                    driver.running.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

pub struct AdvanceReceiver<It, R> {
    driver: Arc<Driver<It, R>>,
}

impl<It, R> Receiver for AdvanceReceiver<It, R>
where
    It: Iterator + Send + 'static,
    It::Item: Send + 'static,
    R: SequenceReceiver<Item = It::Item, Error = Error, Value = ()> + Send + 'static,
    R::NextSender: DetachableInto<AdvanceReceiver<It, R>>,
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
