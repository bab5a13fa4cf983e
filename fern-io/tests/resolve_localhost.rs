//! Resolves `localhost` through a real `IoUringContext`'s worker pool.

use std::pin::pin;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use fern_core::sender::FnReceiver;
use fern_core::{Operation, Sender, StopSource};
use fern_io::resolve_first_ipv4;
use fern_uring::{Config, IoUringContext, PoolConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

fn try_new_context() -> Option<IoUringContext> {
    match IoUringContext::new(Config::default(), PoolConfig::default()) {
        Ok(context) => Some(context),
        Err(error) => {
            eprintln!("skipping resolve_localhost_to_loopback: io_uring unavailable ({error:?})");
            None
        }
    }
}

#[test]
fn resolve_localhost_to_loopback() {
    let Some(mut context) = try_new_context() else {
        return;
    };
    let handle = context.handle();
    let stop_source = StopSource::new();
    let stop_token = stop_source.token();
    let run_thread = thread::spawn(move || context.run(&stop_token));

    let (tx, rx) = mpsc::channel();
    let mut op = pin!(resolve_first_ipv4(handle, "localhost", "http").connect(FnReceiver {
        on_value: move |addr| tx.send(Ok(addr)).unwrap(),
        on_error: move |e| tx.send(Err(e)).unwrap(),
        on_stopped: || panic!("resolve was cancelled"),
    }));
    op.as_mut().start();
    let addr = rx.recv_timeout(TIMEOUT).unwrap().expect("resolve should succeed");
    assert_eq!(addr.ip().to_string(), "127.0.0.1");

    stop_source.request_stop();
    run_thread
        .join()
        .expect("context run loop should not panic")
        .expect("context run loop should not error");
}
