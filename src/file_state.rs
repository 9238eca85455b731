//! Per-open-file cache state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::ids::{Fh, Ino};

bitflags! {
    /// Open flags relevant to the cache's bypass decisions. A small subset
    /// of the kernel's real open-flag space, named after the ones §4.10
    /// actually inspects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileOpenFlags: i32 {
        /// Every write goes to the end of the file; see the append-mode
        /// single-in-flight ordering rule in §5.
        const APPEND = libc::O_APPEND;
        /// Caller bypasses buffering entirely.
        const DIRECT = libc::O_DIRECT;
        /// Caller wants synchronous durability.
        const SYNC = libc::O_SYNC;
    }
}

/// Per-open-file flags and bypass bookkeeping, hung off the caller's
/// fd-context slot.
///
/// All mutable fields are plain atomics rather than a `Mutex`: §5 requires
/// `InodeQueue.lock` and `FileState.lock` to never be held at once, but
/// Phase C of the scheduler (run under the inode lock) still needs to read
/// and flip `dont_wind` per append-mode fd. Lock-free fields sidestep the
/// conflict instead of requiring a second lock acquisition under the first.
pub struct FileState {
    ino: Ino,
    fh: Fh,
    flags: FileOpenFlags,
    disabled: AtomicBool,
    disable_prefix_bytes: AtomicU64,
    /// Scratch flag used transiently by the scheduler's append-ordering
    /// pass. Never persists across a `process_queue` invocation.
    dont_wind: AtomicBool,
}

impl FileState {
    /// Builds the state for a freshly opened fd, deciding whether caching
    /// starts disabled per §4.10: `DIRECT`, read-only, or (`SYNC` with
    /// `enable-O_SYNC`) all disable it outright.
    #[must_use]
    pub fn new(
        ino: Ino,
        fh: Fh,
        flags: FileOpenFlags,
        read_only: bool,
        enable_o_sync: bool,
        disable_prefix_bytes: u64,
    ) -> FileState {
        let disabled = flags.contains(FileOpenFlags::DIRECT)
            || read_only
            || (flags.contains(FileOpenFlags::SYNC) && enable_o_sync);
        FileState {
            ino,
            fh,
            flags,
            disabled: AtomicBool::new(disabled),
            disable_prefix_bytes: AtomicU64::new(disable_prefix_bytes),
            dont_wind: AtomicBool::new(false),
        }
    }

    /// The inode this fd is open against.
    #[must_use]
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// This fd's handle.
    #[must_use]
    pub fn fh(&self) -> Fh {
        self.fh
    }

    /// Raw open flags.
    #[must_use]
    pub fn flags(&self) -> FileOpenFlags {
        self.flags
    }

    /// Whether this fd writes in append mode.
    #[must_use]
    pub fn is_append(&self) -> bool {
        self.flags.contains(FileOpenFlags::APPEND)
    }

    /// Whether caching is currently bypassed for this fd.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Forces caching on or off for every subsequent write on this fd.
    /// Used to propagate a `SYNC` open to every other fd on the inode.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    /// Remaining bypass-prefix byte count.
    #[must_use]
    pub fn disable_prefix_bytes(&self) -> u64 {
        self.disable_prefix_bytes.load(Ordering::Acquire)
    }

    /// Whether this write should bypass the cache: either the fd is fully
    /// disabled, or the disable-prefix countdown has not yet reached zero.
    #[must_use]
    pub fn should_bypass(&self) -> bool {
        self.disabled() || self.disable_prefix_bytes() > 0
    }

    /// Accounts a bypass write of `size` bytes against the disable-prefix
    /// countdown, decrementing by the smaller of `size` and the remaining
    /// count. Only ever called for writes that actually bypass the cache —
    /// per §9's resolved ambiguity, a write that goes through the cache
    /// never touches this counter.
    pub fn account_bypass_write(&self, size: u64) {
        let _ = self
            .disable_prefix_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                Some(remaining.saturating_sub(size.min(remaining)))
            });
    }

    /// Reads `dont_wind` for the current scheduler pass.
    #[must_use]
    pub fn dont_wind(&self) -> bool {
        self.dont_wind.load(Ordering::Acquire)
    }

    /// Sets `dont_wind`, used when two interleaved append-mode fds are
    /// encountered in the same `process_queue` pass.
    pub fn set_dont_wind(&self, value: bool) {
        self.dont_wind.store(value, Ordering::Release);
    }
}
