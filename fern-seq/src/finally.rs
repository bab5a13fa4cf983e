//! `finally`/`tap`: run a second sender as a side effect around `initial`'s
//! completion, the same scope-guard discipline `use_resources`'s close
//! phase uses: an earlier error always wins, a later one only surfaces if
//! there wasn't an earlier one.

use std::pin::Pin;

use fern_core::{spawn_detached, DetachableInto, Error, Operation, Receiver, Sender};

/// What `initial` completed with, handed to `make_final` by reference so it
/// can decide what to run without taking ownership away from the eventual
/// delivery to the real downstream receiver.
pub enum Outcome<V> {
    Value(V),
    Error(Error),
    Stopped,
}

/// Runs `make_final(&outcome)` on every exit path of `initial` and completes
/// with `initial`'s own outcome once `final` finishes. If `initial` errored,
/// that error is what gets delivered regardless of how `final` completes. If
/// `initial` didn't error but `final` does, `final`'s error surfaces instead.
pub fn finally<S, MF, FS>(initial: S, make_final: MF) -> FinallySender<S, MF>
where
    S: Sender<Error = Error>,
    MF: FnOnce(&Outcome<S::Value>) -> FS + Send + 'static,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
{
    FinallySender {
        initial,
        make_final,
    }
}

pub struct FinallySender<S, MF> {
    initial: S,
    make_final: MF,
}

impl<S, MF, FS> Sender for FinallySender<S, MF>
where
    S: Sender<Error = Error> + Send + 'static,
    S::Value: Send + 'static,
    MF: FnOnce(&Outcome<S::Value>) -> FS + Send + 'static,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
{
    type Value = S::Value;
    type Error = Error;
    type Operation<R>
        = S::Operation<InitialReceiver<S::Value, MF, R>>
    where
        R: Receiver<Value = S::Value, Error = Error> + Send + 'static,
        FS: DetachableInto<FinalReceiver<S::Value, R>>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value, Error = Error> + Send + 'static,
        FS: DetachableInto<FinalReceiver<S::Value, R>>,
    {
        self.initial.connect(InitialReceiver {
            make_final: self.make_final,
            receiver,
        })
    }
}

pub struct InitialReceiver<V, MF, R> {
    make_final: MF,
    receiver: R,
}

impl<V, MF, FS, R> Receiver for InitialReceiver<V, MF, R>
where
    MF: FnOnce(&Outcome<V>) -> FS,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
    R: Receiver<Value = V, Error = Error> + Send + 'static,
    FS: DetachableInto<FinalReceiver<V, R>>,
{
    type Value = V;
    type Error = Error;

    fn set_value(self, value: V) {
        run_final(Outcome::Value(value), self.make_final, self.receiver);
    }
    fn set_error(self, error: Error) {
        run_final(Outcome::Error(error), self.make_final, self.receiver);
    }
    fn set_stopped(self) {
        run_final(Outcome::Stopped, self.make_final, self.receiver);
    }
}

fn run_final<V, MF, FS, R>(outcome: Outcome<V>, make_final: MF, receiver: R)
where
    MF: FnOnce(&Outcome<V>) -> FS,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
    R: Receiver<Value = V, Error = Error> + Send + 'static,
    FS: DetachableInto<FinalReceiver<V, R>>,
{
    let final_sender = make_final(&outcome);
    spawn_detached(final_sender, FinalReceiver { outcome, receiver });
}

pub struct FinalReceiver<V, R> {
    outcome: Outcome<V>,
    receiver: R,
}

impl<V, R> Receiver for FinalReceiver<V, R>
where
    R: Receiver<Value = V, Error = Error>,
{
    type Value = ();
    type Error = Error;

    fn set_value(self, _: ()) {
        deliver(self.outcome, self.receiver);
    }

    fn set_error(self, final_error: Error) {
        match self.outcome {
            Outcome::Error(original) => self.receiver.set_error(original),
            Outcome::Value(_) | Outcome::Stopped => self.receiver.set_error(final_error),
        }
    }

    fn set_stopped(self) {
        deliver(self.outcome, self.receiver);
    }
}

fn deliver<V, R>(outcome: Outcome<V>, receiver: R)
where
    R: Receiver<Value = V, Error = Error>,
{
    match outcome {
        Outcome::Value(value) => receiver.set_value(value),
        Outcome::Error(error) => receiver.set_error(error),
        Outcome::Stopped => receiver.set_stopped(),
    }
}

/// Like [`finally`], but `make_final` only runs if `initial` completed with
/// a value; an error or stop is forwarded untouched without invoking it.
pub fn tap<S, MF, FS>(initial: S, make_final: MF) -> TapSender<S, MF>
where
    S: Sender<Error = Error>,
    MF: FnOnce(&S::Value) -> FS + Send + 'static,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
{
    TapSender {
        initial,
        make_final,
    }
}

pub struct TapSender<S, MF> {
    initial: S,
    make_final: MF,
}

impl<S, MF, FS> Sender for TapSender<S, MF>
where
    S: Sender<Error = Error> + Send + 'static,
    S::Value: Send + 'static,
    MF: FnOnce(&S::Value) -> FS + Send + 'static,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
{
    type Value = S::Value;
    type Error = Error;
    type Operation<R>
        = S::Operation<TapInitialReceiver<S::Value, MF, R>>
    where
        R: Receiver<Value = S::Value, Error = Error> + Send + 'static,
        FS: DetachableInto<TapFinalReceiver<S::Value, R>>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = S::Value, Error = Error> + Send + 'static,
        FS: DetachableInto<TapFinalReceiver<S::Value, R>>,
    {
        self.initial.connect(TapInitialReceiver {
            make_final: self.make_final,
            receiver,
        })
    }
}

pub struct TapInitialReceiver<V, MF, R> {
    make_final: MF,
    receiver: R,
}

impl<V, MF, FS, R> Receiver for TapInitialReceiver<V, MF, R>
where
    MF: FnOnce(&V) -> FS,
    FS: Sender<Value = (), Error = Error> + Send + 'static,
    R: Receiver<Value = V, Error = Error> + Send + 'static,
    FS: DetachableInto<TapFinalReceiver<V, R>>,
{
    type Value = V;
    type Error = Error;

    fn set_value(self, value: V) {
        let final_sender = (self.make_final)(&value);
        spawn_detached(
            final_sender,
            TapFinalReceiver {
                value,
                receiver: self.receiver,
            },
        );
    }
    fn set_error(self, error: Error) {
        self.receiver.set_error(error);
    }
    fn set_stopped(self) {
        self.receiver.set_stopped();
    }
}

pub struct TapFinalReceiver<V, R> {
    value: V,
    receiver: R,
}

impl<V, R> Receiver for TapFinalReceiver<V, R>
where
    R: Receiver<Value = V, Error = Error>,
{
    type Value = ();
    type Error = Error;

    fn set_value(self, _: ()) {
        self.receiver.set_value(self.value);
    }
    fn set_error(self, error: Error) {
        self.receiver.set_error(error);
    }
    fn set_stopped(self) {
        self.receiver.set_value(self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_core::sender::{FnReceiver, JustSender};
    use std::cell::RefCell;
    use std::pin::pin;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ErrorSender;

    impl Sender for ErrorSender {
        type Value = u32;
        type Error = Error;
        type Operation<R>
            = ErrorOperation<R>
        where
            R: Receiver<Value = u32, Error = Error>;
        fn connect<R>(self, receiver: R) -> Self::Operation<R>
        where
            R: Receiver<Value = u32, Error = Error>,
        {
            ErrorOperation {
                receiver: Some(receiver),
            }
        }
    }

    struct ErrorOperation<R> {
        receiver: Option<R>,
    }

    impl<R> Operation for ErrorOperation<R>
    where
        R: Receiver<Value = u32, Error = Error>,
    {
        fn start(mut self: Pin<&mut Self>) {
            self.receiver
                .take()
                .expect("start called twice")
                .set_error(Error::InvalidArgument("boom"));
        }
    }

    #[test]
    fn finally_runs_final_after_success_and_keeps_the_value() {
        let final_ran = Arc::new(AtomicUsize::new(0));
        let final_ran2 = final_ran.clone();
        let observed = Rc::new(RefCell::new(None));
        let observed2 = observed.clone();
        let receiver = FnReceiver {
            on_value: move |v: u32| *observed2.borrow_mut() = Some(Ok(v)),
            on_error: move |e: Error| *observed.borrow_mut() = Some(Err(e)),
            on_stopped: || panic!("unexpected stop"),
        };
        let sender = finally(
            JustSender::<u32, Error>::new(42),
            move |_outcome: &Outcome<u32>| {
                final_ran2.fetch_add(1, Ordering::Relaxed);
                JustSender::<(), Error>::new(())
            },
        );
        let mut op = pin!(sender.connect(receiver));
        op.as_mut().start();
        assert_eq!(final_ran.load(Ordering::Relaxed), 1);
        match observed.borrow_mut().take() {
            Some(Ok(42)) => {}
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn tap_skips_final_on_error() {
        let final_ran = Arc::new(AtomicUsize::new(0));
        let final_ran2 = final_ran.clone();
        let receiver = FnReceiver {
            on_value: |_: u32| panic!("unexpected value"),
            on_error: |_: Error| {},
            on_stopped: || panic!("unexpected stop"),
        };
        let sender = tap(ErrorSender, move |_v: &u32| {
            final_ran2.fetch_add(1, Ordering::Relaxed);
            JustSender::<(), Error>::new(())
        });
        let mut op = pin!(sender.connect(receiver));
        op.as_mut().start();
        assert_eq!(final_ran.load(Ordering::Relaxed), 0);
    }
}
