//! Sender/receiver primitives: the single-value completion contract.
//!
//! A [`Receiver`] is completed exactly once, with exactly one of `set_value`,
//! `set_error`, or `set_stopped`. A [`Sender`] describes one asynchronous
//! operation; it is inert until [`Sender::connect`] pairs it with a receiver
//! to produce an [`Operation`], and an `Operation` does nothing until
//! [`Operation::start`] is called. Connecting is allowed to allocate;
//! starting must not.

/// Completed exactly once by whatever drives an [`Operation`] to completion.
pub trait Receiver {
    type Value;
    type Error;

    /// The operation produced a value.
    fn set_value(self, value: Self::Value);
    /// The operation failed.
    fn set_error(self, error: Self::Error);
    /// The operation was cancelled before producing a value or an error.
    fn set_stopped(self);
}

/// A started asynchronous operation. Dropping an `Operation` before it
/// completes is only safe if the operation has in fact already completed;
/// callers must not let one go out of scope while in flight.
pub trait Operation {
    /// Begin the operation. Must be called at most once.
    fn start(self: std::pin::Pin<&mut Self>);
}

/// Describes one asynchronous operation without yet saying who receives its
/// result. `connect` is the only place allowed to allocate.
pub trait Sender {
    type Value;
    type Error;
    type Operation<R>: Operation
    where
        R: Receiver<Value = Self::Value, Error = Self::Error>;

    /// Pair this sender with a receiver, producing a startable operation.
    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Self::Value, Error = Self::Error>;
}

/// A receiver built from three closures, for tests and small glue code that
/// doesn't want to define a full type for a one-off completion.
pub struct FnReceiver<OnValue, OnError, OnStopped> {
    pub on_value: OnValue,
    pub on_error: OnError,
    pub on_stopped: OnStopped,
}

impl<V, E, OnValue, OnError, OnStopped> Receiver for FnReceiver<OnValue, OnError, OnStopped>
where
    OnValue: FnOnce(V),
    OnError: FnOnce(E),
    OnStopped: FnOnce(),
{
    type Value = V;
    type Error = E;

    fn set_value(self, value: V) {
        (self.on_value)(value)
    }

    fn set_error(self, error: E) {
        (self.on_error)(error)
    }

    fn set_stopped(self) {
        (self.on_stopped)()
    }
}

/// A sender that completes inline, synchronously, inside `connect`/`start`
/// with a fixed value. Grounds tests for combinators that don't want to pull
/// in a real io_uring context.
pub struct JustSender<V, E> {
    value: V,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<V, E> JustSender<V, E> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            _marker: std::marker::PhantomData,
        }
    }
}

pub struct JustOperation<R, V> {
    receiver: Option<R>,
    value: Option<V>,
}

impl<R, V, E> Operation for JustOperation<R, V>
where
    R: Receiver<Value = V, Error = E>,
{
    fn start(mut self: std::pin::Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let value = self.value.take().expect("start called twice");
        receiver.set_value(value);
    }
}

impl<V, E> Sender for JustSender<V, E> {
    type Value = V;
    type Error = E;
    type Operation<R>
        = JustOperation<R, V>
    where
        R: Receiver<Value = V, Error = E>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = V, Error = E>,
    {
        JustOperation {
            receiver: Some(receiver),
            value: Some(self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::pin::pin;
    use std::rc::Rc;

    #[test]
    fn just_sender_delivers_value() {
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let receiver = FnReceiver {
            on_value: move |v: i32| *result2.borrow_mut() = Some(v),
            on_error: |_: ()| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let sender: JustSender<i32, ()> = JustSender::new(42);
        let mut op = sender.connect(receiver);
        pin!(op).as_mut().start();
        assert_eq!(*result.borrow(), Some(42));
    }
}
