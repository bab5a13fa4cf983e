//! `eventfd`-based wakeup for the io_uring run loop.
//!
//! Any thread handing work to a parked context (a cross-thread submission,
//! or a worker pool result) writes to the eventfd; the context has it
//! registered in its own io_uring instance (or polls it directly) so a
//! blocking wait on the completion queue wakes up promptly instead of
//! riding out its idle-sleep interval.
//!
//! Grounded on
//! `examples/GssMahadevan-gvthread/crates/ksvc-module/src/eventfd_notifier.rs`.

use std::os::unix::io::RawFd;

use fern_core::{Error, Result};

/// An owned or borrowed `eventfd`, written to wake a parked run loop.
pub struct EventFdNotifier {
    fd: RawFd,
    owned: bool,
}

impl EventFdNotifier {
    /// Create and own a new non-blocking, close-on-exec eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
        }
        Ok(Self { fd, owned: true })
    }

    /// Wrap an eventfd this notifier does not own; it will not be closed on drop.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd, owned: false }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Wake anything waiting on this eventfd. `EAGAIN` (the 64-bit counter
    /// already saturated) is treated as success: the waiter is going to wake
    /// up regardless.
    pub fn notify(&self) -> Result<()> {
        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(Error::Os(errno));
        }
        Ok(())
    }

    /// Drain the counter so a subsequent edge-triggered wait blocks again.
    /// Returns the accumulated count, or `0` if nothing was pending.
    pub fn drain(&self) -> u64 {
        let mut value: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            value
        }
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// SAFETY: the fd is a kernel object; operations on it are already
// synchronized by the kernel.
unsafe impl Send for EventFdNotifier {}
unsafe impl Sync for EventFdNotifier {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_notify_and_drain() {
        let notifier = EventFdNotifier::create().unwrap();
        notifier.notify().unwrap();
        notifier.notify().unwrap();
        assert_eq!(notifier.drain(), 2);
        assert_eq!(notifier.drain(), 0);
    }
}
