//! Crate-wide error type.
//!
//! Every public, fallible entry point in `fern-core`, `fern-mem`, `fern-uring`,
//! `fern-io` and `fern-seq` returns [`Result<T>`]. `Error` is intentionally a
//! flat enum rather than a trait object: call sites match on `Error::Os` to
//! recover the raw `errno` without string comparison.

use std::fmt;

/// The error type shared across the whole framework.
#[derive(Debug)]
pub enum Error {
    /// A syscall, or an io_uring completion, returned a negative `errno`.
    Os(i32),
    /// The upstream allocator could not satisfy a memory pool request.
    AllocationFailed,
    /// A memory-pool bucket index, or another caller-supplied size, was out of range.
    InvalidArgument(&'static str),
    /// A `timeout` combinator's timer fired before the raced sender completed.
    TimedOut,
    /// A ring (submission, completion, SPMC steal ring, MPSC handoff) had no room.
    RingFull,
    /// An operation was attempted on an `IoUringContext` that is not in the
    /// state it requires (e.g. `reset()` while a thread is still running).
    InvalidContextState(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(errno) => write!(f, "system error: errno {errno}"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::RingFull => write!(f, "ring full"),
            Self::InvalidContextState(msg) => write!(f, "invalid context state: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::Os(errno),
            None => Self::Os(libc::EIO),
        }
    }
}

impl Error {
    /// Build an `Error` from a raw negative `errno` as returned in a CQE's `res` field.
    ///
    /// # Panics
    /// Panics in debug builds if `res` is non-negative; callers are expected to have
    /// already branched on the sign.
    #[inline]
    pub fn from_cqe_res(res: i32) -> Self {
        debug_assert!(res < 0, "from_cqe_res called with a non-error result");
        Self::Os(-res)
    }

    /// True iff this error represents `ECANCELED` — the signal that a request was
    /// cancelled via `IORING_OP_ASYNC_CANCEL` rather than failing on its own terms.
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Os(errno) if *errno == libc::ECANCELED)
    }
}

/// Result alias used throughout the framework.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_display() {
        let e = Error::Os(libc::ENOENT);
        assert_eq!(format!("{e}"), format!("system error: errno {}", libc::ENOENT));
    }

    #[test]
    fn cancellation_detection() {
        let e = Error::from_cqe_res(-libc::ECANCELED);
        assert!(e.is_cancellation());
        let e = Error::from_cqe_res(-libc::EIO);
        assert!(!e.is_cancellation());
    }

    #[test]
    fn io_error_conversion_preserves_errno() {
        let io_err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Os(errno) if errno == libc::EAGAIN));
    }
}
