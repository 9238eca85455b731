//! Error type for the cache core.
//!
//! Mirrors the teacher's own style of wrapping a raw POSIX errno rather than
//! pulling in an error-derive crate: a plain newtype with hand-written
//! `Display`/`Error` impls.

use std::fmt;

/// A POSIX errno, as latched on an inode or returned directly from an entry
/// point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// Invalid file descriptor: the caller referenced an fd with no
    /// recorded [`FileState`](crate::file_state::FileState).
    pub const EBADFD: Errno = Errno(libc::EBADF);
    /// Missing or malformed argument at an entry point.
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    /// Generic I/O failure, used to latch short writes.
    pub const EIO: Errno = Errno(libc::EIO);
    /// Allocation failure inside the scheduler or coalescer.
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);

    /// Whether this value represents success (errno 0).
    #[must_use]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Relative severity, used by the inode error latch (§7: "subsequent
    /// errors while a latch is set are overwritten only if more severe").
    /// Allocation failure ranks above a reported backing-store errno, which
    /// ranks above the generic short-write fallback; success ranks lowest
    /// of all so any real error always latches over it.
    #[must_use]
    pub(crate) fn severity(self) -> u8 {
        if self.is_ok() {
            0
        } else if self.0 == libc::ENOMEM {
            3
        } else if self.0 == libc::EIO {
            1
        } else {
            2
        }
    }
}

/// Sentinel for "no error latched".
pub const OK: Errno = Errno(0);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl std::error::Error for Errno {}

impl From<std::io::Error> for Errno {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Errno(code),
            None => Errno::EIO,
        }
    }
}
