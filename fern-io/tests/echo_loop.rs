//! Echo loop over a socket pair, driven against a real `IoUringContext`.
//! Skips gracefully (rather than failing) on kernels too old to support
//! io_uring, the same way `fern_uring::context`'s own unit test promises.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::pin;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use fern_core::sender::FnReceiver;
use fern_core::{ConstBuffer, MutableBuffer, Operation, Sender, StopSource};
use fern_io::net::{ConnectResource, TcpListener};
use fern_io::{Resource, Token};
use fern_uring::{Config, IoUringContext, PoolConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

fn try_new_context() -> Option<IoUringContext> {
    match IoUringContext::new(Config::default(), PoolConfig::default()) {
        Ok(context) => Some(context),
        Err(error) => {
            eprintln!("skipping echo_loop_over_socket_pair: io_uring unavailable ({error:?})");
            None
        }
    }
}

#[test]
fn echo_loop_over_socket_pair() {
    let Some(mut context) = try_new_context() else {
        return;
    };
    let handle = context.handle();
    let stop_source = StopSource::new();
    let stop_token = stop_source.token();
    let run_thread = thread::spawn(move || context.run(&stop_token));

    let listener = TcpListener::bind(handle.clone(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16)
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (accept_tx, accept_rx) = mpsc::channel();
    let mut accept_op = pin!(listener.accept().open().connect(FnReceiver {
        on_value: move |token| accept_tx.send(Ok(token)).unwrap(),
        on_error: move |e| accept_tx.send(Err(e)).unwrap(),
        on_stopped: || panic!("accept was cancelled"),
    }));
    accept_op.as_mut().start();

    let connect_resource =
        ConnectResource::new(handle.clone(), addr).expect("connect resource should construct");
    let (connect_tx, connect_rx) = mpsc::channel();
    let mut connect_op = pin!(connect_resource.open().connect(FnReceiver {
        on_value: move |token| connect_tx.send(Ok(token)).unwrap(),
        on_error: move |e| connect_tx.send(Err(e)).unwrap(),
        on_stopped: || panic!("connect was cancelled"),
    }));
    connect_op.as_mut().start();

    let server_token = accept_rx.recv_timeout(TIMEOUT).unwrap().expect("accept should succeed");
    let client_token = connect_rx.recv_timeout(TIMEOUT).unwrap().expect("connect should succeed");

    let payload: &'static [u8] = b"hello world\0";
    let (send_tx, send_rx) = mpsc::channel();
    let mut send_op = pin!(client_token.send(ConstBuffer::new(payload), 0).connect(FnReceiver {
        on_value: move |n| send_tx.send(Ok(n)).unwrap(),
        on_error: move |e| send_tx.send(Err(e)).unwrap(),
        on_stopped: || panic!("send was cancelled"),
    }));
    send_op.as_mut().start();
    let sent = send_rx.recv_timeout(TIMEOUT).unwrap().expect("send should succeed");
    assert_eq!(sent, payload.len());

    let recv_storage: &'static mut [u8; 12] = Box::leak(Box::new([0u8; 12]));
    let recv_ptr: *mut [u8; 12] = recv_storage;
    let (recv_tx, recv_rx) = mpsc::channel();
    let mut recv_op = pin!(server_token
        .recv(MutableBuffer::new(unsafe { &mut *recv_ptr }), 0)
        .connect(FnReceiver {
            on_value: move |n| recv_tx.send(Ok(n)).unwrap(),
            on_error: move |e| recv_tx.send(Err(e)).unwrap(),
            on_stopped: || panic!("recv was cancelled"),
        }));
    recv_op.as_mut().start();
    let received = recv_rx.recv_timeout(TIMEOUT).unwrap().expect("recv should succeed");
    assert_eq!(received, 12);
    assert_eq!(unsafe { &*recv_ptr }, payload);

    let (client_close_tx, client_close_rx) = mpsc::channel();
    let mut client_close_op = pin!(client_token.close().connect(FnReceiver {
        on_value: move |_| client_close_tx.send(Ok(())).unwrap(),
        on_error: move |e| client_close_tx.send(Err(e)).unwrap(),
        on_stopped: || panic!("close was cancelled"),
    }));
    client_close_op.as_mut().start();
    client_close_rx.recv_timeout(TIMEOUT).unwrap().expect("client close should succeed");

    let (server_close_tx, server_close_rx) = mpsc::channel();
    let mut server_close_op = pin!(server_token.close().connect(FnReceiver {
        on_value: move |_| server_close_tx.send(Ok(())).unwrap(),
        on_error: move |e| server_close_tx.send(Err(e)).unwrap(),
        on_stopped: || panic!("close was cancelled"),
    }));
    server_close_op.as_mut().start();
    server_close_rx.recv_timeout(TIMEOUT).unwrap().expect("server close should succeed");

    stop_source.request_stop();
    run_thread
        .join()
        .expect("context run loop should not panic")
        .expect("context run loop should not error");
}
