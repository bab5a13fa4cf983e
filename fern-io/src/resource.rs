//! The async resource protocol: `open`/`use_resource` with deterministic,
//! first-error-wins cleanup.
//!
//! Every resource this framework hands out (a file descriptor, a connected
//! socket, an accepted connection) needs exactly the discipline
//! `examples/GssMahadevan-gvthread/crates/ksvc-gvthread/src/net.rs`'s
//! `GvtListener`/`GvtStream` apply by hand — open the fd, use it, close it on
//! every exit path including the error ones. This module generalizes that
//! pattern into a sender/receiver vocabulary so `fern-seq` combinators (and
//! callers) get that guarantee without writing their own `Drop` impl per
//! resource type. A [`Token`] is required to be cheaply `Clone` (file
//! descriptors are `Copy`) so the body can use a copy of it while the
//! resource machinery retains the original to close once the body's sender
//! completes.

use std::pin::Pin;

use fern_core::sequence::{SequenceReceiver, SequenceSender};
use fern_core::{spawn_detached, DetachableInto, Error, Operation, Receiver, Sender};

/// Something that can be opened into a [`Token`].
pub trait Resource {
    type Token: Token;
    type OpenSender: Sender<Value = Self::Token, Error = Error>;

    fn open(&self) -> Self::OpenSender;
}

/// A handle valid for the duration of one `use` region; closing it is the
/// only way it's reclaimed.
pub trait Token: Clone {
    type CloseSender: Sender<Value = (), Error = Error>;

    fn close(self) -> Self::CloseSender;
}

/// Turn `resource` into a sequence of exactly one item — a copy of the open
/// token — valid until the downstream `set_next` sender completes, at which
/// point the original token is closed before the sequence itself completes.
///
/// Error during open propagates as the sequence's error. Error during the
/// body propagates after close has completed. Error during close is
/// surfaced only if the body didn't already fail — a close failure never
/// masks a real error, but it also never overrides one.
pub fn use_resource<R: Resource>(resource: R) -> UseSender<R> {
    UseSender { resource }
}

pub struct UseSender<R: Resource> {
    resource: R,
}

impl<R> SequenceSender for UseSender<R>
where
    R: Resource,
    R::Token: Send + 'static,
    R::OpenSender: 'static,
    <R::Token as Token>::CloseSender: 'static,
{
    type Item = R::Token;
    type Error = Error;
    type Operation<Recv>
        = UseOperation<R, Recv>
    where
        Recv: SequenceReceiver<Item = R::Token, Error = Error, Value = ()>,
        R::OpenSender: DetachableInto<OpenOutcomeReceiver<Recv>>,
        Recv::NextSender: DetachableInto<CloseAfterReceiver<Recv>>,
        <R::Token as Token>::CloseSender: DetachableInto<CloseCompleteReceiver<Recv>>;

    fn connect<Recv>(self, receiver: Recv) -> Self::Operation<Recv>
    where
        Recv: SequenceReceiver<Item = R::Token, Error = Error, Value = ()>,
        R::OpenSender: DetachableInto<OpenOutcomeReceiver<Recv>>,
        Recv::NextSender: DetachableInto<CloseAfterReceiver<Recv>>,
        <R::Token as Token>::CloseSender: DetachableInto<CloseCompleteReceiver<Recv>>,
    {
        UseOperation {
            resource: self.resource,
            receiver: Some(receiver),
        }
    }
}

pub struct UseOperation<R: Resource, Recv> {
    resource: R,
    receiver: Option<Recv>,
}

impl<R, Recv> Operation for UseOperation<R, Recv>
where
    R: Resource,
    R::Token: Send + 'static,
    R::OpenSender: 'static,
    <R::Token as Token>::CloseSender: 'static,
    Recv: SequenceReceiver<Item = R::Token, Error = Error, Value = ()> + Send + 'static,
    // `spawn_detached` needs each sender it fires (open, the body, close) to
    // be detachable into the receiver this module wraps it in.
    R::OpenSender: DetachableInto<OpenOutcomeReceiver<Recv>>,
    Recv::NextSender: DetachableInto<CloseAfterReceiver<Recv>>,
    <R::Token as Token>::CloseSender: DetachableInto<CloseCompleteReceiver<Recv>>,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let open_sender = self.resource.open();
        spawn_detached(open_sender, OpenOutcomeReceiver { receiver });
    }
}

/// `Tok` (the token type) is `Recv::Item`, not a free generic parameter —
/// keeping it projected off `Recv` instead of introducing its own type
/// variable avoids an unconstrained-parameter error, since nothing here
/// stores a `Tok` value directly.
struct OpenOutcomeReceiver<Recv> {
    receiver: Recv,
}

impl<Recv> Receiver for OpenOutcomeReceiver<Recv>
where
    Recv: SequenceReceiver<Error = Error, Value = ()> + Send + 'static,
    Recv::Item: Token + Send + 'static,
    Recv::NextSender: DetachableInto<CloseAfterReceiver<Recv>>,
    <Recv::Item as Token>::CloseSender: DetachableInto<CloseCompleteReceiver<Recv>>,
{
    type Value = Recv::Item;
    type Error = Error;

    fn set_value(self, token: Recv::Item) {
        let body_sender = self.receiver.set_next(token.clone());
        spawn_detached(
            body_sender,
            CloseAfterReceiver {
                receiver: self.receiver,
                token,
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

enum BodyOutcome {
    Value,
    Error(Error),
    Stopped,
}

struct CloseAfterReceiver<Recv: SequenceReceiver> {
    receiver: Recv,
    token: Recv::Item,
}

impl<Recv> Receiver for CloseAfterReceiver<Recv>
where
    Recv: SequenceReceiver<Error = Error, Value = ()> + Send + 'static,
    Recv::Item: Token + Send + 'static,
    <Recv::Item as Token>::CloseSender: DetachableInto<CloseCompleteReceiver<Recv>>,
{
    type Value = ();
    type Error = Error;

    fn set_value(self, _: ()) {
        close_then_forward(self.token, self.receiver, BodyOutcome::Value);
    }

    fn set_error(self, error: Error) {
        close_then_forward(self.token, self.receiver, BodyOutcome::Error(error));
    }

    fn set_stopped(self) {
        close_then_forward(self.token, self.receiver, BodyOutcome::Stopped);
    }
}

fn close_then_forward<Recv>(token: Recv::Item, receiver: Recv, outcome: BodyOutcome)
where
    Recv: SequenceReceiver<Error = Error, Value = ()> + Send + 'static,
    Recv::Item: Token + Send + 'static,
    <Recv::Item as Token>::CloseSender: DetachableInto<CloseCompleteReceiver<Recv>>,
{
    let close_sender = token.close();
    spawn_detached(close_sender, CloseCompleteReceiver { receiver, outcome });
}

struct CloseCompleteReceiver<Recv> {
    receiver: Recv,
    outcome: BodyOutcome,
}

impl<Recv> Receiver for CloseCompleteReceiver<Recv>
where
    Recv: Receiver<Value = (), Error = Error> + Send + 'static,
{
    type Value = ();
    type Error = Error;

    fn set_value(self, _: ()) {
        forward(self.receiver, self.outcome);
    }

    fn set_error(self, close_error: Error) {
        // A close failure is only surfaced if the body didn't already fail
        // or stop; a real error or a stop request always wins.
        match self.outcome {
            BodyOutcome::Value => self.receiver.set_error(close_error),
            other => forward(self.receiver, other),
        }
    }

    fn set_stopped(self) {
        forward(self.receiver, self.outcome);
    }
}

fn forward<Recv>(receiver: Recv, outcome: BodyOutcome)
where
    Recv: Receiver<Value = (), Error = Error>,
{
    match outcome {
        BodyOutcome::Value => receiver.set_value(()),
        BodyOutcome::Error(e) => receiver.set_error(e),
        BodyOutcome::Stopped => receiver.set_stopped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fern_core::sender::JustSender;
    use std::pin::pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    #[derive(Clone)]
    struct TestToken {
        id: u32,
        closed: Arc<AtomicBool>,
    }

    impl Token for TestToken {
        type CloseSender = JustSender<(), Error>;
        fn close(self) -> Self::CloseSender {
            self.closed.store(true, Ordering::Release);
            JustSender::new(())
        }
    }

    struct TestResource {
        id: u32,
        closed: Arc<AtomicBool>,
    }

    impl Resource for TestResource {
        type Token = TestToken;
        type OpenSender = JustSender<TestToken, Error>;
        fn open(&self) -> Self::OpenSender {
            JustSender::new(TestToken {
                id: self.id,
                closed: self.closed.clone(),
            })
        }
    }

    struct OneShotSequenceReceiver {
        seen_ids: Arc<std::sync::Mutex<Vec<u32>>>,
        done: mpsc::Sender<()>,
    }

    impl Receiver for OneShotSequenceReceiver {
        type Value = ();
        type Error = Error;
        fn set_value(self, _: ()) {
            self.done.send(()).unwrap();
        }
        fn set_error(self, _: Error) {
            panic!("unexpected sequence error");
        }
        fn set_stopped(self) {
            panic!("unexpected sequence stop");
        }
    }

    impl SequenceReceiver for OneShotSequenceReceiver {
        type Item = TestToken;
        type NextSender = JustSender<(), Error>;

        fn set_next(&self, item: TestToken) -> Self::NextSender {
            self.seen_ids.lock().unwrap().push(item.id);
            JustSender::new(())
        }
    }

    #[test]
    fn use_resource_opens_yields_item_and_closes() {
        let closed = Arc::new(AtomicBool::new(false));
        let resource = TestResource {
            id: 7,
            closed: closed.clone(),
        };
        let seen_ids = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        let receiver = OneShotSequenceReceiver {
            seen_ids: seen_ids.clone(),
            done: tx,
        };
        let mut op = pin!(use_resource(resource).connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(*seen_ids.lock().unwrap(), vec![7]);
        assert!(closed.load(Ordering::Acquire));
    }

    /// A sender that always fails with the given error, for exercising the
    /// error-propagation arm of `use_resource`'s close-then-forward logic.
    struct FailSender(Error);

    struct FailOperation<R> {
        error: Option<Error>,
        receiver: Option<R>,
    }

    impl Sender for FailSender {
        type Value = ();
        type Error = Error;
        type Operation<R>
            = FailOperation<R>
        where
            R: Receiver<Value = (), Error = Error>;

        fn connect<R>(self, receiver: R) -> Self::Operation<R>
        where
            R: Receiver<Value = (), Error = Error>,
        {
            FailOperation {
                error: Some(self.0),
                receiver: Some(receiver),
            }
        }
    }

    impl<R> Operation for FailOperation<R>
    where
        R: Receiver<Value = (), Error = Error>,
    {
        fn start(mut self: Pin<&mut Self>) {
            let receiver = self.receiver.take().expect("start called twice");
            let error = self.error.take().expect("start called twice");
            receiver.set_error(error);
        }
    }

    #[test]
    fn close_runs_even_when_body_errors() {
        struct ErroringSequenceReceiver {
            calls: Arc<AtomicUsize>,
            done: mpsc::Sender<Error>,
        }
        impl Receiver for ErroringSequenceReceiver {
            type Value = ();
            type Error = Error;
            fn set_value(self, _: ()) {
                panic!("expected the propagated body error, not a value");
            }
            fn set_error(self, e: Error) {
                self.done.send(e).unwrap();
            }
            fn set_stopped(self) {
                panic!("unexpected stop");
            }
        }
        impl SequenceReceiver for ErroringSequenceReceiver {
            type Item = TestToken;
            type NextSender = FailSender;
            fn set_next(&self, _item: TestToken) -> Self::NextSender {
                self.calls.fetch_add(1, Ordering::AcqRel);
                FailSender(Error::InvalidArgument("body failed"))
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let resource = TestResource {
            id: 3,
            closed: closed.clone(),
        };
        let (tx, rx) = mpsc::channel();
        let receiver = ErroringSequenceReceiver {
            calls: Arc::new(AtomicUsize::new(0)),
            done: tx,
        };
        let mut op = pin!(use_resource(resource).connect(receiver));
        op.as_mut().start();
        let err = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert!(matches!(err, Error::InvalidArgument("body failed")));
        assert!(closed.load(Ordering::Acquire));
    }
}
