//! Thin, typed wrappers over the `io-uring` crate's opcode builders for the
//! requests the framework's I/O operations need to submit.
//!
//! Every function here just builds an unsubmitted
//! [`io_uring::squeue::Entry`]; the caller (a [`crate::task::RawTask`]'s
//! `prepare` callback) is responsible for tagging it with `user_data` before
//! handing it to [`crate::context::IoUringContext`]. Grounded directly on
//! `examples/GssMahadevan-gvthread/crates/ksvc-module/src/basic_iouring.rs`'s
//! use of the real `io-uring` crate's safe opcode builders.

use io_uring::{opcode, squeue::Entry, types::Fd};
use std::os::unix::io::RawFd;

pub fn read(fd: RawFd, buf: *mut u8, len: u32, offset: u64) -> Entry {
    opcode::Read::new(Fd(fd), buf, len).offset(offset).build()
}

pub fn readv(fd: RawFd, iovecs: *const libc::iovec, count: u32, offset: u64) -> Entry {
    opcode::Readv::new(Fd(fd), iovecs, count).offset(offset).build()
}

pub fn write(fd: RawFd, buf: *const u8, len: u32, offset: u64) -> Entry {
    opcode::Write::new(Fd(fd), buf, len).offset(offset).build()
}

pub fn writev(fd: RawFd, iovecs: *const libc::iovec, count: u32, offset: u64) -> Entry {
    opcode::Writev::new(Fd(fd), iovecs, count).offset(offset).build()
}

pub fn open_at(dir_fd: RawFd, path: *const libc::c_char, flags: i32, mode: u32) -> Entry {
    opcode::OpenAt::new(Fd(dir_fd), path)
        .flags(flags)
        .mode(mode)
        .build()
}

pub fn close(fd: RawFd) -> Entry {
    opcode::Close::new(Fd(fd)).build()
}

pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addr_len: *mut libc::socklen_t, flags: i32) -> Entry {
    opcode::Accept::new(Fd(fd), addr, addr_len).flags(flags).build()
}

pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addr_len: libc::socklen_t) -> Entry {
    opcode::Connect::new(Fd(fd), addr, addr_len).build()
}

pub fn send(fd: RawFd, buf: *const u8, len: u32, flags: i32) -> Entry {
    opcode::Send::new(Fd(fd), buf, len).flags(flags).build()
}

pub fn recv(fd: RawFd, buf: *mut u8, len: u32, flags: i32) -> Entry {
    opcode::Recv::new(Fd(fd), buf, len).flags(flags).build()
}

pub fn send_msg(fd: RawFd, msg: *const libc::msghdr, flags: u32) -> Entry {
    opcode::SendMsg::new(Fd(fd), msg).flags(flags).build()
}

pub fn recv_msg(fd: RawFd, msg: *mut libc::msghdr, flags: u32) -> Entry {
    opcode::RecvMsg::new(Fd(fd), msg).flags(flags).build()
}

pub fn shutdown(fd: RawFd, how: i32) -> Entry {
    opcode::Shutdown::new(Fd(fd), how).build()
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> Entry {
    opcode::Socket::new(domain, ty, protocol).build()
}

pub fn rename_at(
    old_dir_fd: RawFd,
    old_path: *const libc::c_char,
    new_dir_fd: RawFd,
    new_path: *const libc::c_char,
) -> Entry {
    opcode::RenameAt::new(Fd(old_dir_fd), old_path, Fd(new_dir_fd), new_path).build()
}

pub fn unlink_at(dir_fd: RawFd, path: *const libc::c_char, flags: i32) -> Entry {
    opcode::UnlinkAt::new(Fd(dir_fd), path).flags(flags).build()
}

pub fn mkdir_at(dir_fd: RawFd, path: *const libc::c_char, mode: u32) -> Entry {
    opcode::MkDirAt::new(Fd(dir_fd), path).mode(mode).build()
}

pub fn symlink_at(target: *const libc::c_char, new_dir_fd: RawFd, link_path: *const libc::c_char) -> Entry {
    opcode::SymlinkAt::new(target, Fd(new_dir_fd), link_path).build()
}

pub fn link_at(
    old_dir_fd: RawFd,
    old_path: *const libc::c_char,
    new_dir_fd: RawFd,
    new_path: *const libc::c_char,
    flags: i32,
) -> Entry {
    opcode::LinkAt::new(Fd(old_dir_fd), old_path, Fd(new_dir_fd), new_path)
        .flags(flags)
        .build()
}

pub fn splice(
    fd_in: RawFd,
    off_in: i64,
    fd_out: RawFd,
    off_out: i64,
    len: u32,
    flags: u32,
) -> Entry {
    opcode::Splice::new(Fd(fd_in), off_in, Fd(fd_out), off_out, len)
        .flags(flags)
        .build()
}

/// `IORING_OP_ASYNC_CANCEL` targeting the submission tagged with `user_data`.
pub fn async_cancel(user_data: u64) -> Entry {
    opcode::AsyncCancel::new(user_data).build()
}

/// One-shot `IORING_OP_POLL_ADD` for readability on `fd`. Used to let a
/// blocking `io_uring_enter` wake on the context's notifier eventfd instead
/// of only on real I/O completions; consumed on completion and re-armed by
/// the caller.
pub fn poll_add_readable(fd: RawFd) -> Entry {
    opcode::PollAdd::new(Fd(fd), libc::POLLIN as u32).build()
}
