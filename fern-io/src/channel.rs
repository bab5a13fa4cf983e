//! A broadcast sequence channel: every subscriber sees every notified item.
//!
//! Grounded on
//! `examples/GssMahadevan-gvthread/crates/gvthread-core/src/channel.rs`'s
//! `channel()`/`Sender`/`Receiver` pair, but reworked from that file's bounded
//! SPSC-per-pair buffer (one value goes to exactly one waiting receiver) into
//! a fan-out broadcast: `notify_all` delivers one item to every still-active
//! subscriber, using [`AsyncMutex`](crate::mutex::AsyncMutex) in place of the
//! teacher's `SpinLock` to protect the subscriber list, and
//! `fern_core::spawn_detached` in place of the teacher's commented-out
//! `// TODO: Mark waiter GVThread as ready via scheduler` placeholders for
//! actually driving a subscriber's next-item sender to completion.
//!
//! `close()` doesn't just complete the currently-registered subscribers —
//! it waits for every in-flight `notify_all` delivery spawned before it ran
//! to finish first, so a caller that closes right after a notify can't
//! observe the channel as closed while a delivery from that notify is still
//! in flight.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fern_core::sender::FnReceiver;
use fern_core::sequence::{SequenceReceiver, SequenceSender};
use fern_core::{spawn_detached, Error, Operation, Receiver, Sender};

use crate::mutex::{AsyncMutex, MutexGuard};

trait SubscriberSlot<T>: Send {
    fn id(&self) -> u64;
    fn deliver(&self, item: T, on_done: Box<dyn FnOnce(bool) + Send>);
    fn close(self: Box<Self>);
}

struct ConcreteSubscriber<T, R> {
    id: u64,
    receiver: R,
    _marker: PhantomData<fn(T)>,
}

impl<T, R> SubscriberSlot<T> for ConcreteSubscriber<T, R>
where
    T: Clone + Send + 'static,
    R: SequenceReceiver<Item = T, Error = Error, Value = ()> + Send + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn deliver(&self, item: T, on_done: Box<dyn FnOnce(bool) + Send>) {
        let next_sender = self.receiver.set_next(item);
        let done_receiver = FnReceiver {
            on_value: move |_: ()| on_done(false),
            on_error: move |_: Error| on_done(false),
            on_stopped: move || on_done(true),
        };
        spawn_detached(next_sender, done_receiver);
    }

    fn close(self: Box<Self>) {
        self.receiver.set_value(());
    }
}

type Subscribers<T> = Vec<Box<dyn SubscriberSlot<T>>>;

struct ChannelInner<T: Clone + Send + 'static> {
    subscribers: AsyncMutex<Subscribers<T>>,
    next_id: AtomicU64,
    /// Outstanding per-subscriber deliveries spawned by `notify_all` — the
    /// channel's "scope" `close()` waits to drain before completing.
    in_flight: AtomicUsize,
    /// `close()`'s completion, parked here if `in_flight` wasn't already
    /// zero when it drained the subscriber list. Fired by whichever side —
    /// the last in-flight delivery finishing, or `close()` itself finding
    /// the count already at zero — observes the drain complete.
    drain_waiter: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

fn try_fire_drain_waiter<T: Clone + Send + 'static>(inner: &Arc<ChannelInner<T>>) {
    if inner.in_flight.load(Ordering::Acquire) == 0 {
        if let Some(cb) = inner.drain_waiter.lock().unwrap().take() {
            cb();
        }
    }
}

/// A broadcast channel of items of type `T`. `subscribe()` yields a sequence
/// sender; `notify_all` delivers one item to every currently subscribed
/// receiver.
pub struct AsyncChannel<T: Clone + Send + 'static> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Clone + Send + 'static> AsyncChannel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                subscribers: AsyncMutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                drain_waiter: Mutex::new(None),
            }),
        }
    }

    /// A sequence sender; connecting and starting it registers the receiver
    /// as a subscriber. It never completes on its own — only when
    /// [`Self::close`] runs, or the receiver's own next-sender reports
    /// `stopped`, does it leave the subscriber list.
    pub fn subscribe(&self) -> SubscribeSender<T> {
        SubscribeSender {
            inner: self.inner.clone(),
        }
    }

    /// Deliver `item` to every current subscriber, completing once every one
    /// of them has acknowledged (or asked to stop).
    pub fn notify_all(&self, item: T) -> NotifySender<T> {
        NotifySender {
            inner: self.inner.clone(),
            item,
        }
    }

    /// Complete every subscriber with `value(())` and wait for each one's
    /// removal to be recorded before completing.
    pub fn close(&self) -> CloseSender<T> {
        CloseSender {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Clone for AsyncChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn remove_subscriber<T: Clone + Send + 'static>(inner: Arc<ChannelInner<T>>, id: u64) {
    let remove_receiver = FnReceiver {
        on_value: move |mut guard: MutexGuard<Subscribers<T>>| {
            guard.retain(|s| s.id() != id);
        },
        on_error: |_: Error| unreachable!("mutex lock never errors"),
        on_stopped: || unreachable!("mutex lock never stops"),
    };
    spawn_detached(inner.subscribers.lock(), remove_receiver);
}

/// A sender produced by [`AsyncChannel::subscribe`].
pub struct SubscribeSender<T: Clone + Send + 'static> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Clone + Send + 'static> SequenceSender for SubscribeSender<T> {
    type Item = T;
    type Error = Error;
    type Operation<R>
        = SubscribeOperation<T, R>
    where
        R: SequenceReceiver<Item = T, Error = Error, Value = ()>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: SequenceReceiver<Item = T, Error = Error, Value = ()>,
    {
        SubscribeOperation {
            inner: self.inner,
            receiver: Some(receiver),
        }
    }
}

pub struct SubscribeOperation<T: Clone + Send + 'static, R> {
    inner: Arc<ChannelInner<T>>,
    receiver: Option<R>,
}

impl<T, R> Operation for SubscribeOperation<T, R>
where
    T: Clone + Send + 'static,
    R: SequenceReceiver<Item = T, Error = Error, Value = ()> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: Box<dyn SubscriberSlot<T>> = Box::new(ConcreteSubscriber {
            id,
            receiver,
            _marker: PhantomData,
        });
        let push_receiver = FnReceiver {
            on_value: move |mut guard: MutexGuard<Subscribers<T>>| {
                guard.push(slot);
            },
            on_error: |_: Error| unreachable!("mutex lock never errors"),
            on_stopped: || unreachable!("mutex lock never stops"),
        };
        spawn_detached(self.inner.subscribers.lock(), push_receiver);
    }
}

/// A sender produced by [`AsyncChannel::notify_all`].
pub struct NotifySender<T: Clone + Send + 'static> {
    inner: Arc<ChannelInner<T>>,
    item: T,
}

impl<T: Clone + Send + 'static> Sender for NotifySender<T> {
    type Value = ();
    type Error = Error;
    type Operation<R>
        = NotifyOperation<T, R>
    where
        R: Receiver<Value = (), Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = (), Error = Error>,
    {
        NotifyOperation {
            inner: self.inner,
            item: self.item,
            receiver: Some(receiver),
        }
    }
}

pub struct NotifyOperation<T: Clone + Send + 'static, R> {
    inner: Arc<ChannelInner<T>>,
    item: T,
    receiver: Option<R>,
}

impl<T, R> Operation for NotifyOperation<T, R>
where
    T: Clone + Send + 'static,
    R: Receiver<Value = (), Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let inner = self.inner.clone();
        let item = self.item.clone();
        let receiver_cell = Arc::new(Mutex::new(Some(receiver)));
        let lock_receiver = FnReceiver {
            on_value: move |guard: MutexGuard<Subscribers<T>>| {
                let count = guard.len();
                if count == 0 {
                    drop(guard);
                    if let Some(r) = receiver_cell.lock().unwrap().take() {
                        r.set_value(());
                    }
                    return;
                }
                let remaining = Arc::new(AtomicUsize::new(count));
                for sub in guard.iter() {
                    let remaining = remaining.clone();
                    let receiver_cell = receiver_cell.clone();
                    let inner = inner.clone();
                    let id = sub.id();
                    let item = item.clone();
                    inner.in_flight.fetch_add(1, Ordering::AcqRel);
                    sub.deliver(
                        item,
                        Box::new(move |stopped| {
                            if stopped {
                                remove_subscriber(inner.clone(), id);
                            }
                            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                                if let Some(r) = receiver_cell.lock().unwrap().take() {
                                    r.set_value(());
                                }
                            }
                            if inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                                try_fire_drain_waiter(&inner);
                            }
                        }),
                    );
                }
            },
            on_error: |_: Error| unreachable!("mutex lock never errors"),
            on_stopped: || unreachable!("mutex lock never stops"),
        };
        spawn_detached(self.inner.subscribers.lock(), lock_receiver);
    }
}

/// A sender produced by [`AsyncChannel::close`].
pub struct CloseSender<T: Clone + Send + 'static> {
    inner: Arc<ChannelInner<T>>,
}

impl<T: Clone + Send + 'static> Sender for CloseSender<T> {
    type Value = ();
    type Error = Error;
    type Operation<R>
        = CloseOperation<T, R>
    where
        R: Receiver<Value = (), Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = (), Error = Error>,
    {
        CloseOperation {
            inner: self.inner,
            receiver: Some(receiver),
        }
    }
}

pub struct CloseOperation<T: Clone + Send + 'static, R> {
    inner: Arc<ChannelInner<T>>,
    receiver: Option<R>,
}

impl<T, R> Operation for CloseOperation<T, R>
where
    T: Clone + Send + 'static,
    R: Receiver<Value = (), Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let inner = self.inner.clone();
        let lock_receiver = FnReceiver {
            on_value: move |mut guard: MutexGuard<Subscribers<T>>| {
                for slot in guard.drain(..) {
                    slot.close();
                }
                drop(guard);
                *inner.drain_waiter.lock().unwrap() = Some(Box::new(move || receiver.set_value(())));
                try_fire_drain_waiter(&inner);
            },
            on_error: |_: Error| unreachable!("mutex lock never errors"),
            on_stopped: || unreachable!("mutex lock never stops"),
        };
        spawn_detached(self.inner.subscribers.lock(), lock_receiver);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    struct RecordingReceiver {
        seen: Arc<StdMutex<Vec<u32>>>,
    }

    impl Receiver for RecordingReceiver {
        type Value = ();
        type Error = Error;
        fn set_value(self, _: ()) {}
        fn set_error(self, _: Error) {}
        fn set_stopped(self) {}
    }

    impl SequenceReceiver for RecordingReceiver {
        type Item = u32;
        type NextSender = fern_core::sender::JustSender<(), Error>;

        fn set_next(&self, item: u32) -> Self::NextSender {
            self.seen.lock().unwrap().push(item);
            fern_core::sender::JustSender::new(())
        }
    }

    #[test]
    fn notify_with_no_subscribers_completes_immediately() {
        let channel: AsyncChannel<u32> = AsyncChannel::new();
        let (tx, rx) = mpsc::channel();
        let receiver = FnReceiver {
            on_value: move |_: ()| tx.send(()).unwrap(),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut op = pin!(channel.notify_all(1).connect(receiver));
        op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn subscriber_receives_notified_items() {
        let channel: AsyncChannel<u32> = AsyncChannel::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sub = RecordingReceiver { seen: seen.clone() };
        let mut sub_op = pin!(channel.subscribe().connect(sub));
        sub_op.as_mut().start();

        let (tx, rx) = mpsc::channel();
        for item in [10u32, 20, 30] {
            let tx = tx.clone();
            let receiver = FnReceiver {
                on_value: move |_: ()| tx.send(()).unwrap(),
                on_error: |_: Error| panic!("unexpected error"),
                on_stopped: || panic!("unexpected stop"),
            };
            let mut op = pin!(channel.notify_all(item).connect(receiver));
            op.as_mut().start();
            rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![10, 20, 30]);
    }

    struct DelayedSender {
        delivered: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Sender for DelayedSender {
        type Value = ();
        type Error = Error;
        type Operation<R>
            = DelayedOperation<R>
        where
            R: Receiver<Value = (), Error = Error> + Send + 'static;
        fn connect<R>(self, receiver: R) -> Self::Operation<R>
        where
            R: Receiver<Value = (), Error = Error> + Send + 'static,
        {
            DelayedOperation {
                delivered: self.delivered,
                receiver: Some(receiver),
            }
        }
    }

    struct DelayedOperation<R> {
        delivered: Arc<std::sync::atomic::AtomicBool>,
        receiver: Option<R>,
    }

    impl<R> Operation for DelayedOperation<R>
    where
        R: Receiver<Value = (), Error = Error> + Send + 'static,
    {
        fn start(mut self: Pin<&mut Self>) {
            let receiver = self.receiver.take().expect("start called twice");
            let delivered = self.delivered.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                delivered.store(true, Ordering::Release);
                receiver.set_value(());
            });
        }
    }

    struct SlowSubscriber {
        delivered: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Receiver for SlowSubscriber {
        type Value = ();
        type Error = Error;
        fn set_value(self, _: ()) {}
        fn set_error(self, _: Error) {}
        fn set_stopped(self) {}
    }

    impl SequenceReceiver for SlowSubscriber {
        type Item = u32;
        type NextSender = DelayedSender;
        fn set_next(&self, _item: u32) -> Self::NextSender {
            DelayedSender {
                delivered: self.delivered.clone(),
            }
        }
    }

    #[test]
    fn close_waits_for_in_flight_notify_to_drain() {
        let channel: AsyncChannel<u32> = AsyncChannel::new();
        let delivered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let sub = SlowSubscriber {
            delivered: delivered.clone(),
        };
        let mut sub_op = pin!(channel.subscribe().connect(sub));
        sub_op.as_mut().start();

        let notify_receiver = FnReceiver {
            on_value: |_: ()| {},
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut notify_op = pin!(channel.notify_all(7).connect(notify_receiver));
        notify_op.as_mut().start();

        let (tx, rx) = mpsc::channel();
        let close_receiver = FnReceiver {
            on_value: move |_: ()| tx.send(()).unwrap(),
            on_error: |_: Error| panic!("unexpected error"),
            on_stopped: || panic!("unexpected stop"),
        };
        let mut close_op = pin!(channel.close().connect(close_receiver));
        close_op.as_mut().start();
        rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert!(delivered.load(Ordering::Acquire));
    }
}
