//! `repeat`: restart a sender every time it completes with a value, until
//! stopped. Like [`crate::iterate`], the restart loop is trampolined so a
//! run of synchronously-completing restarts can't grow the stack.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::cancel::StopToken;
use fern_core::{spawn_detached, DetachableInto, Error, Operation, Receiver, Sender};

/// Invokes `factory()` to produce a fresh sender, runs it, and invokes it
/// again every time it completes with a value, until `stop_token` is
/// cancelled (checked before each restart). An error from any invocation
/// ends the loop and propagates. Cancellation ends the loop with
/// `stopped()`.
pub fn repeat<F, S>(factory: F, stop_token: StopToken) -> RepeatSender<F>
where
    F: Fn() -> S + Send + 'static,
    S: Sender<Value = (), Error = Error> + Send + 'static,
{
    RepeatSender {
        factory,
        stop_token,
    }
}

pub struct RepeatSender<F> {
    factory: F,
    stop_token: StopToken,
}

impl<F, S> Sender for RepeatSender<F>
where
    F: Fn() -> S + Send + 'static,
    S: Sender<Value = (), Error = Error> + Send + 'static,
{
    type Value = ();
    type Error = Error;
    type Operation<R>
        = RepeatOperation<F, R>
    where
        R: Receiver<Value = (), Error = Error> + Send + 'static,
        S: DetachableInto<StepReceiver<F, R>>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = (), Error = Error> + Send + 'static,
        S: DetachableInto<StepReceiver<F, R>>,
    {
        RepeatOperation {
            driver: Some(Arc::new(Driver {
                factory: self.factory,
                stop_token: self.stop_token,
                receiver: Mutex::new(Some(receiver)),
                running: AtomicBool::new(false),
                pending: AtomicBool::new(false),
            })),
        }
    }
}

struct Driver<F, R> {
    factory: F,
    stop_token: StopToken,
    receiver: Mutex<Option<R>>,
    running: AtomicBool,
    pending: AtomicBool,
}

pub struct RepeatOperation<F, R> {
    driver: Option<Arc<Driver<F, R>>>,
}

impl<F, S, R> Operation for RepeatOperation<F, R>
where
    F: Fn() -> S + Send + 'static,
    S: Sender<Value = (), Error = Error> + Send + 'static,
    R: Receiver<Value = (), Error = Error> + Send + 'static,
    S: DetachableInto<StepReceiver<F, R>>,
{
    fn start(mut self: Pin<&mut Self>) {
        let driver = self.driver.take().expect("start called twice");
        advance::<F, S, R>(driver);
    }
}

fn advance<F, S, R>(driver: Arc<Driver<F, R>>)
where
    F: Fn() -> S + Send + 'static,
    S: Sender<Value = (), Error = Error> + Send + 'static,
    R: Receiver<Value = (), Error = Error> + Send + 'static,
    S: DetachableInto<StepReceiver<F, R>>,
{
    if driver.running.swap(true, Ordering::AcqRel) {
        driver.pending.store(true, Ordering::Release);
        return;
    }
    loop {
        if driver.stop_token.is_cancelled() {
            driver.running.store(false, Ordering::Release);
            if let Some(receiver) = driver.receiver.lock().unwrap().take() {
                receiver.set_stopped();
            }
            return;
        }
        let sender = (driver.factory)();
        driver.pending.store(false, Ordering::Release);
        spawn_detached(
            sender,
            StepReceiver {
                driver: driver.clone(),
            },
        );
        if !driver.pending.load(Ordering::Acquire) {
            driver.running.store(false, Ordering::Release);
            return;
        }
    }
}

pub struct StepReceiver<F, R> {
    driver: Arc<Driver<F, R>>,
}

impl<F, S, R> Receiver for StepReceiver<F, R>
where
    F: Fn() -> S + Send + 'static,
    S: Sender<Value = (), Error = Error> + Send + 'static,
    R: Receiver<Value = (), Error = Error> + Send + 'static,
    S: DetachableInto<StepReceiver<F, R>>,
{
    type Value = ();
    type Error = Error;

    fn set_value(self, _: ()) {
        advance::<F, S, R>(self.driver);
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
    use fern_core::cancel::StopSource;
    use fern_core::sender::JustSender;
    use std::pin::pin;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    struct FnReceiverStub {
        done: mpsc::Sender<()>,
    }

    impl Receiver for FnReceiverStub {
        type Value = ();
        type Error = Error;
        fn set_value(self, _: ()) {
            panic!("repeat should never complete with value");
        }
        fn set_error(self, error: Error) {
            panic!("unexpected error: {error:?}");
        }
        fn set_stopped(self) {
            self.done.send(()).unwrap();
        }
    }

    #[test]
    fn repeat_restarts_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let stop_source = Arc::new(StopSource::new());
        let stop_token = stop_source.token();
        let (tx, rx) = mpsc::channel();
        let receiver = FnReceiverStub { done: tx };
        let count2 = count.clone();
        let stop_source2 = stop_source.clone();
        let seq = repeat(
            move || {
                let n = count2.fetch_add(1, Ordering::Relaxed) + 1;
                if n >= 5 {
                    stop_source2.request_stop();
                }
                JustSender::<(), Error>::new(())
            },
            stop_token,
        );
        let mut op = pin!(seq.connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
