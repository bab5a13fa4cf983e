//! File resource and file I/O: `open_at`/`close`/`read`/`write` as the
//! [`Resource`]/[`Token`]/[`SqeOp`] vocabulary, grounded on the same
//! `io-uring` opcodes `fern_uring::ops` already wraps.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::Arc;

use fern_core::{
    ConstBuffer, ConstBufferSubspan, Error, MutableBuffer, MutableBufferSubspan, Operation, Receiver, Result, Sender,
};
use fern_mem::{Pool, PoolBuffer};
use fern_uring::Handle;

use crate::resource::{Resource, Token};
use crate::sqe::{IoSender, SqeOp};

/// A file to be opened relative to a directory fd (`libc::AT_FDCWD` for an
/// absolute or cwd-relative path).
pub struct OpenFile {
    handle: Handle,
    dir_fd: RawFd,
    path: CString,
    flags: i32,
    mode: u32,
}

impl OpenFile {
    pub fn new(handle: Handle, path: impl Into<Vec<u8>>, flags: i32, mode: u32) -> Result<Self> {
        let path = CString::new(path).map_err(|_| Error::InvalidArgument("path contains a NUL byte"))?;
        Ok(Self {
            handle,
            dir_fd: libc::AT_FDCWD,
            path,
            flags,
            mode,
        })
    }
}

impl Resource for OpenFile {
    type Token = FileToken;
    type OpenSender = IoSender<OpenAtParams>;

    fn open(&self) -> Self::OpenSender {
        IoSender::new(
            self.handle.clone(),
            OpenAtParams {
                handle: self.handle.clone(),
                dir_fd: self.dir_fd,
                path: self.path.clone(),
                flags: self.flags,
                mode: self.mode,
            },
        )
    }
}

pub struct OpenAtParams {
    handle: Handle,
    dir_fd: RawFd,
    path: CString,
    flags: i32,
    mode: u32,
}

impl SqeOp for OpenAtParams {
    type Value = FileToken;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::open_at(self.dir_fd, self.path.as_ptr(), self.flags, self.mode)
    }

    fn map_result(self, res: i32) -> Result<FileToken> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(FileToken {
                handle: self.handle,
                fd: res as RawFd,
            })
        }
    }
}

/// An open file descriptor, valid until [`Token::close`] completes.
#[derive(Clone)]
pub struct FileToken {
    handle: Handle,
    fd: RawFd,
}

impl FileToken {
    /// Wraps an already-open fd (a `memfd_create`'d file, an inherited
    /// descriptor, ...) as a token without going through [`OpenFile`].
    /// Ownership passes to the token: it is closed like any other once
    /// [`Token::close`] completes.
    pub fn from_raw_fd(handle: Handle, fd: RawFd) -> Self {
        Self { handle, fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// A sender reading up to `buf.len()` bytes starting at `offset`.
    pub fn read(&self, buf: MutableBuffer<'static>, offset: u64) -> IoSender<ReadParams> {
        IoSender::new(
            self.handle.clone(),
            ReadParams {
                fd: self.fd,
                buf,
                offset,
            },
        )
    }

    /// A sender reading into each buffer of `bufs` in turn (`preadv2`-style
    /// scatter read) starting at `offset`.
    pub fn readv(&self, bufs: MutableBufferSubspan<'static>, offset: u64) -> IoSender<ReadvParams> {
        IoSender::new(
            self.handle.clone(),
            ReadvParams {
                fd: self.fd,
                iovecs: unsafe { bufs.to_iovecs() },
                bufs,
                offset,
            },
        )
    }

    /// A sender writing each buffer of `bufs` in turn (`pwritev2`-style
    /// gather write) starting at `offset`.
    pub fn writev(&self, bufs: ConstBufferSubspan<'static>, offset: u64) -> IoSender<WritevParams> {
        IoSender::new(
            self.handle.clone(),
            WritevParams {
                fd: self.fd,
                iovecs: bufs.to_iovecs(),
                bufs,
                offset,
            },
        )
    }

    /// A sender reading up to `size` bytes starting at `offset` into a buffer
    /// checked out of `pool` rather than one the caller already owns — the
    /// buffer comes back alongside the byte count on completion, so the
    /// caller only ever pays `pool`'s bucketed allocator for scratch read
    /// space instead of the global allocator.
    pub fn read_pooled(&self, pool: Arc<Pool>, size: usize, offset: u64) -> PooledReadSender {
        PooledReadSender {
            handle: self.handle.clone(),
            pool,
            fd: self.fd,
            size,
            offset,
        }
    }

    /// A sender writing `buf` starting at `offset`.
    pub fn write(&self, buf: ConstBuffer<'static>, offset: u64) -> IoSender<WriteParams> {
        IoSender::new(
            self.handle.clone(),
            WriteParams {
                fd: self.fd,
                buf,
                offset,
            },
        )
    }
}

impl Token for FileToken {
    type CloseSender = IoSender<CloseParams>;

    fn close(self) -> Self::CloseSender {
        IoSender::new(self.handle, CloseParams::new(self.fd))
    }
}

pub struct ReadParams {
    fd: RawFd,
    buf: MutableBuffer<'static>,
    offset: u64,
}

impl SqeOp for ReadParams {
    type Value = usize;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::read(self.fd, self.buf.as_ptr() as *mut u8, self.buf.len() as u32, self.offset)
    }

    fn map_result(self, res: i32) -> Result<usize> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(res as usize)
        }
    }
}

/// `iovecs` is computed once, at construction, from `bufs` and kept alongside
/// it: the kernel reads the `iovec` array by pointer for the lifetime of the
/// request, so it has to live exactly as long as this params value does
/// rather than being rebuilt inside `build`.
pub struct ReadvParams {
    fd: RawFd,
    bufs: MutableBufferSubspan<'static>,
    iovecs: Vec<libc::iovec>,
    offset: u64,
}

impl SqeOp for ReadvParams {
    type Value = usize;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::readv(self.fd, self.iovecs.as_ptr(), self.iovecs.len() as u32, self.offset)
    }

    fn map_result(self, res: i32) -> Result<usize> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(res as usize)
        }
    }
}

pub struct WritevParams {
    fd: RawFd,
    bufs: ConstBufferSubspan<'static>,
    iovecs: Vec<libc::iovec>,
    offset: u64,
}

impl SqeOp for WritevParams {
    type Value = usize;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::writev(self.fd, self.iovecs.as_ptr(), self.iovecs.len() as u32, self.offset)
    }

    fn map_result(self, res: i32) -> Result<usize> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(res as usize)
        }
    }
}

pub struct WriteParams {
    fd: RawFd,
    buf: ConstBuffer<'static>,
    offset: u64,
}

impl SqeOp for WriteParams {
    type Value = usize;

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::write(self.fd, self.buf.as_ptr(), self.buf.len() as u32, self.offset)
    }

    fn map_result(self, res: i32) -> Result<usize> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok(res as usize)
        }
    }
}

/// A sender that checks out a buffer from a [`Pool`] and reads into it,
/// completing with the buffer and the byte count together so the caller can
/// hand the same buffer straight back to `pool` once it's done with the
/// bytes.
pub struct PooledReadSender {
    handle: Handle,
    pool: Arc<Pool>,
    fd: RawFd,
    size: usize,
    offset: u64,
}

impl Sender for PooledReadSender {
    type Value = (PoolBuffer, usize);
    type Error = Error;
    type Operation<R>
        = PooledReadOperation<R>
    where
        R: Receiver<Value = (PoolBuffer, usize), Error = Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = (PoolBuffer, usize), Error = Error>,
    {
        PooledReadOperation {
            handle: self.handle,
            pool: self.pool,
            fd: self.fd,
            size: self.size,
            offset: self.offset,
            receiver: Some(receiver),
        }
    }
}

pub struct PooledReadOperation<R> {
    handle: Handle,
    pool: Arc<Pool>,
    fd: RawFd,
    size: usize,
    offset: u64,
    receiver: Option<R>,
}

impl<R> Operation for PooledReadOperation<R>
where
    R: Receiver<Value = (PoolBuffer, usize), Error = Error> + Send + 'static,
{
    fn start(mut self: Pin<&mut Self>) {
        let receiver = self.receiver.take().expect("start called twice");
        let alloc_receiver = PooledReadAllocReceiver {
            handle: self.handle.clone(),
            fd: self.fd,
            offset: self.offset,
            outer: receiver,
        };
        let mut op = self.pool.allocate(self.size).connect(alloc_receiver);
        unsafe { Pin::new_unchecked(&mut op) }.start();
    }
}

struct PooledReadAllocReceiver<R> {
    handle: Handle,
    fd: RawFd,
    offset: u64,
    outer: R,
}

impl<R> Receiver for PooledReadAllocReceiver<R>
where
    R: Receiver<Value = (PoolBuffer, usize), Error = Error> + Send + 'static,
{
    type Value = PoolBuffer;
    type Error = Error;

    fn set_value(self, buf: PoolBuffer) {
        let params = PooledReadParams {
            fd: self.fd,
            buf,
            offset: self.offset,
        };
        let mut op = IoSender::new(self.handle, params).connect(self.outer);
        unsafe { Pin::new_unchecked(&mut op) }.start();
    }

    fn set_error(self, error: Error) {
        self.outer.set_error(error);
    }

    fn set_stopped(self) {
        self.outer.set_stopped();
    }
}

struct PooledReadParams {
    fd: RawFd,
    buf: PoolBuffer,
    offset: u64,
}

impl SqeOp for PooledReadParams {
    type Value = (PoolBuffer, usize);

    fn build(&self) -> io_uring::squeue::Entry {
        let ptr = self.buf.as_const_buffer().as_ptr() as *mut u8;
        fern_uring::ops::read(self.fd, ptr, self.buf.len() as u32, self.offset)
    }

    fn map_result(self, res: i32) -> Result<(PoolBuffer, usize)> {
        if res < 0 {
            Err(Error::from_cqe_res(res))
        } else {
            Ok((self.buf, res as usize))
        }
    }
}

pub struct CloseParams {
    fd: RawFd,
}

impl CloseParams {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl SqeOp for CloseParams {
    type Value = ();

    fn build(&self) -> io_uring::squeue::Entry {
        fern_uring::ops::close(self.fd)
    }

    // `close(2)` never meaningfully fails on Linux (EINTR can't happen
    // behind io_uring); report success unconditionally rather than surface
    // an errno a caller could do nothing useful with.
    fn map_result(self, _res: i32) -> Result<()> {
        Ok(())
    }
}
