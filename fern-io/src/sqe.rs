//! Generic single-SQE operation template shared by every concrete I/O
//! operation in this crate (open, close, read, write, accept, connect,
//! send, recv, sendmsg, recvmsg).
//!
//! Every one of those operations follows the same shape `context::ScheduleOperation`
//! already establishes: embed the receiver and whatever fields the SQE needs
//! behind a leaked, type-erased pointer; hand the context a [`RawTask`]; let
//! the `complete` callback reclaim the allocation and map the CQE's `res`
//! into a value or an `Error`. [`SqeOp`] is the one piece that varies per
//! operation — build the SQE, map the result.

use std::pin::Pin;

use fern_core::{Error, Operation, Receiver, Result, StopToken};
use fern_uring::{Handle, RawTask, TaskVTable};

/// What a single concrete I/O operation (open, read, write, ...) contributes:
/// how to build its SQE, and how to turn a completed CQE's `res` into a value.
pub trait SqeOp: Send + 'static {
    type Value;

    fn build(&self) -> io_uring::squeue::Entry;

    /// `res` is the CQE's result field; always `< 0` encodes `-errno`. Close
    /// overrides this to swallow errors (see `fern-io::file::CloseParams`);
    /// everyone else maps `res < 0` straight to `Error::from_cqe_res`. Takes
    /// `self` by value (rather than being a bare function of `res`) so an
    /// open operation can fold its own captured state — the `Handle` a
    /// resulting token needs to submit its own close — into the value it
    /// produces.
    fn map_result(self, res: i32) -> Result<Self::Value>;
}

/// A sender that submits one SQE built from `P` and completes with `P::Value`.
pub struct IoSender<P> {
    handle: Handle,
    params: P,
    stop_token: StopToken,
}

impl<P: SqeOp> IoSender<P> {
    pub fn new(handle: Handle, params: P) -> Self {
        Self {
            handle,
            params,
            stop_token: StopToken::never(),
        }
    }

    /// Cancel the submitted SQE (`IORING_OP_ASYNC_CANCEL`) the moment `token`
    /// is stopped, rather than only when it happens to complete on its own.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop_token = token;
        self
    }
}

impl<P: SqeOp> fern_core::Sender for IoSender<P> {
    type Value = P::Value;
    type Error = Error;
    type Operation<R>
        = IoOperation<P, R>
    where
        R: Receiver<Value = P::Value, Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = P::Value, Error = Error>,
    {
        IoOperation {
            handle: self.handle,
            params: Some(self.params),
            receiver: Some(receiver),
            stop_token: self.stop_token,
        }
    }
}

pub struct IoOperation<P, R> {
    handle: Handle,
    params: Option<P>,
    receiver: Option<R>,
    stop_token: StopToken,
}

struct IoTaskData<P, R> {
    params: P,
    receiver: R,
}

unsafe fn io_ready<P, R>(_data: *const ()) -> bool {
    false
}

unsafe fn io_prepare<P: SqeOp, R>(data: *const ()) -> io_uring::squeue::Entry {
    let data = &*(data as *const IoTaskData<P, R>);
    data.params.build()
}

unsafe fn io_complete<P: SqeOp, R>(data: *const (), res: i32, _flags: u32)
where
    R: Receiver<Value = P::Value, Error = Error>,
{
    let boxed = Box::from_raw(data as *mut IoTaskData<P, R>);
    let IoTaskData { params, receiver } = *boxed;
    if res == -libc::ECANCELED {
        receiver.set_stopped();
        return;
    }
    match params.map_result(res) {
        Ok(value) => receiver.set_value(value),
        Err(error) => receiver.set_error(error),
    }
}

fn io_vtable<P, R>() -> &'static TaskVTable
where
    P: SqeOp,
    R: Receiver<Value = P::Value, Error = Error> + Send + 'static,
{
    static VTABLE: std::sync::OnceLock<TaskVTable> = std::sync::OnceLock::new();
    // NB: this `OnceLock` is monomorphized per `(P, R)` instantiation, same as
    // `context::per_receiver_vtable` — one static per concrete pair, not one
    // shared across all of them.
    VTABLE.get_or_init(|| TaskVTable {
        prepare: io_prepare::<P, R>,
        complete: io_complete::<P, R>,
        ready: io_ready::<P, R>,
    })
}

impl<P, R> Operation for IoOperation<P, R>
where
    P: SqeOp,
    R: Receiver<Value = P::Value, Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let params = self.params.take().expect("start called twice");
        let receiver = self.receiver.take().expect("start called twice");
        let leaked = Box::into_raw(Box::new(IoTaskData { params, receiver }));
        let vtable = io_vtable::<P, R>();
        let raw = unsafe { RawTask::new(leaked as *const (), vtable) };
        match self.handle.submit(raw) {
            Ok(id) => {
                let handle = self.handle.clone();
                self.stop_token.on_stop(move || {
                    let _ = handle.cancel(id);
                });
            }
            Err(_) => {
                let boxed = unsafe { Box::from_raw(leaked) };
                boxed.receiver.set_stopped();
            }
        }
    }
}
