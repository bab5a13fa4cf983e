//! DNS resolution as a sender.
//!
//! `getaddrinfo` has no io_uring opcode; the original io_uring frameworks in
//! this space run it through `getaddrinfo_a` with `SIGEV_THREAD` completion
//! notification. That's a second, parallel async-notification mechanism
//! this framework doesn't need: `fern_uring::Handle::run_blocking` already
//! hands blocking syscalls off to the context's worker pool and wakes the
//! context's eventfd when done, so resolution is just another blocking call
//! routed through the pool that already exists for `getaddrinfo`-shaped
//! work (see `fern_uring::pool`).

use std::ffi::CString;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use fern_core::{Error, Operation, Receiver, Result, Sender};
use fern_uring::Handle;

/// Resolves `host`/`service` on IPv4 and completes with the first address
/// `getaddrinfo` returns.
pub fn resolve_first_ipv4(handle: Handle, host: impl Into<String>, service: impl Into<String>) -> ResolveSender {
    ResolveSender {
        handle,
        host: host.into(),
        service: service.into(),
    }
}

pub struct ResolveSender {
    handle: Handle,
    host: String,
    service: String,
}

impl Sender for ResolveSender {
    type Value = SocketAddrV4;
    type Error = Error;
    type Operation<R>
        = ResolveOperation<R>
    where
        R: Receiver<Value = SocketAddrV4, Error = Error> + Send + 'static;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = SocketAddrV4, Error = Error> + Send + 'static,
    {
        ResolveOperation {
            handle: self.handle,
            host: self.host,
            service: self.service,
            receiver: Some(receiver),
        }
    }
}

pub struct ResolveOperation<R> {
    handle: Handle,
    host: String,
    service: String,
    receiver: Option<R>,
}

impl<R> Operation for ResolveOperation<R>
where
    R: Receiver<Value = SocketAddrV4, Error = Error> + Send + 'static,
{
    fn start(mut self: std::pin::Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let receiver_cell = Arc::new(Mutex::new(Some(receiver)));
        let cell = receiver_cell.clone();
        let host = self.host.clone();
        let service = self.service.clone();
        let work = move || {
            let result = getaddrinfo_first_ipv4(&host, &service);
            if let Some(receiver) = cell.lock().unwrap().take() {
                match result {
                    Ok(addr) => receiver.set_value(addr),
                    Err(error) => receiver.set_error(error),
                }
            }
        };
        if self.handle.run_blocking(work).is_err() {
            if let Some(receiver) = receiver_cell.lock().unwrap().take() {
                receiver.set_stopped();
            }
        }
    }
}

fn getaddrinfo_first_ipv4(host: &str, service: &str) -> Result<SocketAddrV4> {
    let host_c = CString::new(host).map_err(|_| Error::InvalidArgument("host contains a NUL byte"))?;
    let service_c = CString::new(service).map_err(|_| Error::InvalidArgument("service contains a NUL byte"))?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut result: *mut libc::addrinfo = std::ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(host_c.as_ptr(), service_c.as_ptr(), &hints, &mut result)
    };
    if rc != 0 {
        return Err(Error::InvalidArgument("getaddrinfo failed to resolve host/service"));
    }

    let addr = unsafe {
        let entry = result.as_ref().ok_or(Error::InvalidArgument("getaddrinfo returned no results"))?;
        let sockaddr = entry.ai_addr as *const libc::sockaddr_in;
        let sin = sockaddr.as_ref().ok_or(Error::InvalidArgument("getaddrinfo returned a non-IPv4 address"))?;
        let ip = Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
        let port = u16::from_be(sin.sin_port);
        Ok(SocketAddrV4::new(ip, port))
    };
    unsafe { libc::freeaddrinfo(result) };
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getaddrinfo_resolves_localhost_to_loopback() {
        let addr = getaddrinfo_first_ipv4("localhost", "http").expect("resolution should succeed");
        assert_eq!(*addr.ip(), Ipv4Addr::new(127, 0, 0, 1));
    }
}
