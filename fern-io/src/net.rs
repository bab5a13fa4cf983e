//! TCP listener and stream resources. Socket creation, `bind`, and `listen`
//! happen synchronously the way
//! `examples/GssMahadevan-gvthread/crates/ksvc-gvthread/src/net.rs`'s
//! `GvtListener::bind_socket` does them — there is no io_uring opcode for any
//! of the three, so there is nothing to gain from routing them through the
//! ring. `accept` and `connect` are true io_uring operations and go through
//! [`crate::sqe`] like every other I/O primitive here.

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

use fern_core::{ConstBuffer, Error, MutableBuffer, Result};
use fern_uring::Handle;

use crate::file::CloseParams;
use crate::resource::{Resource, Token};
use crate::sqe::{IoSender, SqeOp};

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

fn raw_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// A TCP listener bound and put into the listen backlog synchronously.
pub struct TcpListener {
    handle: Handle,
    fd: RawFd,
}

impl TcpListener {
    pub fn bind(handle: Handle, addr: SocketAddrV4, backlog: i32) -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::Os(raw_errno()));
        }
        let opt: i32 = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const _,
                std::mem::size_of_val(&opt) as u32,
            );
        }
        let sa = sockaddr_in(addr);
        let bind_res = unsafe {
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of_val(&sa) as u32,
            )
        };
        if bind_res != 0 {
            let errno = raw_errno();
            unsafe { libc::close(fd) };
            return Err(Error::Os(errno));
        }
        if unsafe { libc::listen(fd, backlog) } != 0 {
            let errno = raw_errno();
            unsafe { libc::close(fd) };
            return Err(Error::Os(errno));
        }
        Ok(Self { handle, fd })
    }

    /// A resource whose single item is the accepted connection's token.
    pub fn accept(&self) -> AcceptResource {
        AcceptResource {
            handle: self.handle.clone(),
            fd: self.fd,
        }
    }

    /// The address actually bound — useful after binding to port `0` to let
    /// the kernel pick one.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(self.fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
        if rc != 0 {
            return Err(Error::Os(raw_errno()));
        }
        let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sa.sin_addr.s_addr.to_ne_bytes()));
        Ok(SocketAddrV4::new(ip, u16::from_be(sa.sin_port)))
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub struct AcceptResource {
    handle: Handle,
    fd: RawFd,
}

impl Resource for AcceptResource {
    type Token = TcpStreamToken;
    type OpenSender = IoSender<AcceptParams>;

    fn open(&self) -> Self::OpenSender {
        IoSender::new(
            self.handle.clone(),
            AcceptParams {
                handle: self.handle.clone(),
                fd: self.fd,
                addr: Box::new(unsafe { std::mem::zeroed() }),
                addr_len: Box::new(std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t),
            },
        )
    }
}

pub struct AcceptParams {
    handle: Handle,
    fd: RawFd,
    addr: Box<libc::sockaddr_in>,
    addr_len: Box<libc::socklen_t>,
}

impl SqeOp for AcceptParams {
    type Value = TcpStreamToken;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::accept(
            self.fd,
            self.addr.as_ref() as *const _ as *mut libc::sockaddr,
            self.addr_len.as_ref() as *const _ as *mut libc::socklen_t,
            libc::SOCK_CLOEXEC,
        )
    }

    fn map_result(self, res: i32) -> Result<TcpStreamToken> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(TcpStreamToken {
                handle: self.handle,
                fd: res as RawFd,
            })
        }
    }
}

/// A resource that creates a socket synchronously and connects it via
/// io_uring's `CONNECT` opcode.
pub struct ConnectResource {
    handle: Handle,
    fd: RawFd,
    addr: SocketAddrV4,
}

impl ConnectResource {
    pub fn new(handle: Handle, addr: SocketAddrV4) -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::Os(raw_errno()));
        }
        Ok(Self { handle, fd, addr })
    }
}

impl Resource for ConnectResource {
    type Token = TcpStreamToken;
    type OpenSender = IoSender<ConnectParams>;

    fn open(&self) -> Self::OpenSender {
        IoSender::new(
            self.handle.clone(),
            ConnectParams {
                handle: self.handle.clone(),
                fd: self.fd,
                addr: Box::new(sockaddr_in(self.addr)),
            },
        )
    }
}

pub struct ConnectParams {
    handle: Handle,
    fd: RawFd,
    addr: Box<libc::sockaddr_in>,
}

impl SqeOp for ConnectParams {
    type Value = TcpStreamToken;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::connect(
            self.fd,
            self.addr.as_ref() as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    }

    fn map_result(self, res: i32) -> Result<TcpStreamToken> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(TcpStreamToken {
                handle: self.handle,
                fd: self.fd,
            })
        }
    }
}

/// A connected TCP socket, valid until [`Token::close`] completes.
#[derive(Clone)]
pub struct TcpStreamToken {
    handle: Handle,
    fd: RawFd,
}

impl TcpStreamToken {
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn send(&self, buf: ConstBuffer<'static>, flags: i32) -> IoSender<SendParams> {
        IoSender::new(
            self.handle.clone(),
            SendParams {
                fd: self.fd,
                buf,
                flags,
            },
        )
    }

    pub fn recv(&self, buf: MutableBuffer<'static>, flags: i32) -> IoSender<RecvParams> {
        IoSender::new(
            self.handle.clone(),
            RecvParams {
                fd: self.fd,
                buf,
                flags,
            },
        )
    }
}

impl Token for TcpStreamToken {
    type CloseSender = IoSender<CloseParams>;

    fn close(self) -> Self::CloseSender {
        IoSender::new(self.handle, CloseParams::new(self.fd))
    }
}

pub struct SendParams {
    fd: RawFd,
    buf: ConstBuffer<'static>,
    flags: i32,
}

impl SqeOp for SendParams {
    type Value = usize;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::send(self.fd, self.buf.as_ptr(), self.buf.len() as u32, self.flags)
    }

    fn map_result(self, res: i32) -> Result<usize> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(res as usize)
        }
    }
}

pub struct RecvParams {
    fd: RawFd,
    buf: MutableBuffer<'static>,
    flags: i32,
}

impl SqeOp for RecvParams {
    type Value = usize;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::recv(self.fd, self.buf.as_ptr() as *mut u8, self.buf.len() as u32, self.flags)
    }

    fn map_result(self, res: i32) -> Result<usize> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(res as usize)
        }
    }
}
