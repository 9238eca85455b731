//! The dump surface: read-only snapshots of inode and fd state for
//! diagnostics, matching §6's "Dump surface" shape. Formatting and the
//! actual ioctl/signal wiring that would expose these snapshots live with
//! the surrounding translator, out of scope for this core (§1).

#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::file_state::FileOpenFlags;
use crate::ids::{Fh, Ino, LockOwner};
use crate::inode_queue::InodeQueue;
use crate::request::{OpKind, Request, WriteFlags};

/// One request's dumped shape: kind, size, offset, and flags.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize))]
pub struct RequestSnapshot {
    /// Sequence number, for stable ordering in a dump.
    pub seq: u64,
    /// Short tag for the op kind (`"write"`, `"read"`, `"stat"`, ...).
    pub kind: &'static str,
    /// Payload size; zero for non-writes.
    pub size: u64,
    /// Byte offset; zero for ops with none.
    pub offset: i64,
    /// Owner, for writes.
    pub owner: Option<LockOwner>,
    /// Write-specific flag names currently set.
    pub flags: Vec<&'static str>,
}

fn write_flag_names(flags: WriteFlags) -> Vec<&'static str> {
    let mut names = Vec::new();
    if flags.contains(WriteFlags::STACK_WOUND) {
        names.push("stack_wound");
    }
    if flags.contains(WriteFlags::WRITE_BEHIND) {
        names.push("write_behind");
    }
    if flags.contains(WriteFlags::GOT_REPLY) {
        names.push("got_reply");
    }
    if flags.contains(WriteFlags::VIRGIN) {
        names.push("virgin");
    }
    if flags.contains(WriteFlags::FLUSH_ALL) {
        names.push("flush_all");
    }
    names
}

impl RequestSnapshot {
    fn of(req: &Request) -> RequestSnapshot {
        req.with_kind(|k| match k {
            OpKind::Write {
                offset,
                buf,
                owner,
                flags,
                ..
            } => RequestSnapshot {
                seq: req.seq(),
                kind: "write",
                size: buf.len() as u64,
                offset: *offset,
                owner: Some(*owner),
                flags: write_flag_names(*flags),
            },
            OpKind::Read { offset, size, .. } => RequestSnapshot {
                seq: req.seq(),
                kind: "read",
                size: u64::from(*size),
                offset: *offset,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Stat => RequestSnapshot {
                seq: req.seq(),
                kind: "stat",
                size: 0,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Fstat { .. } => RequestSnapshot {
                seq: req.seq(),
                kind: "fstat",
                size: 0,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Truncate { size } => RequestSnapshot {
                seq: req.seq(),
                kind: "truncate",
                size: *size,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Ftruncate { size, .. } => RequestSnapshot {
                seq: req.seq(),
                kind: "ftruncate",
                size: *size,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Setattr { .. } => RequestSnapshot {
                seq: req.seq(),
                kind: "setattr",
                size: 0,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Flush { .. } => RequestSnapshot {
                seq: req.seq(),
                kind: "flush",
                size: 0,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
            OpKind::Fsync { .. } => RequestSnapshot {
                seq: req.seq(),
                kind: "fsync",
                size: 0,
                offset: 0,
                owner: None,
                flags: Vec::new(),
            },
        })
    }
}

/// One inode's dumped shape.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize))]
pub struct InodeSnapshot {
    /// The inode.
    pub ino: Ino,
    /// Configured window limit.
    pub window_conf: u64,
    /// Bytes acknowledged but not yet confirmed.
    pub window_current: u64,
    /// Bytes queued but not yet shipped.
    pub aggregate_current: u64,
    /// Currently latched error, `0` if none.
    pub latched_error: i32,
    /// Requests currently in `active`, oldest first.
    pub requests: Vec<RequestSnapshot>,
}

/// One open-fd's dumped shape.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serializable", derive(Serialize))]
pub struct FdSnapshot {
    /// The fd.
    pub fh: Fh,
    /// Raw open flags relevant to caching decisions.
    pub flags: i32,
    /// Whether caching is currently bypassed for this fd.
    pub disabled: bool,
    /// Remaining disable-prefix byte count.
    pub disable_prefix_bytes: u64,
}

impl InodeSnapshot {
    pub(crate) fn of(ino: Ino, queue: &InodeQueue) -> InodeSnapshot {
        let state = queue.lock();
        InodeSnapshot {
            ino,
            window_conf: state.window_conf,
            window_current: state.window_current,
            aggregate_current: state.aggregate_current,
            latched_error: state.latched_error.0,
            requests: state.active.iter().map(RequestSnapshot::of).collect(),
        }
    }
}

impl FdSnapshot {
    pub(crate) fn of(fh: Fh, flags: FileOpenFlags, disabled: bool, disable_prefix_bytes: u64) -> FdSnapshot {
        FdSnapshot {
            fh,
            flags: flags.bits(),
            disabled,
            disable_prefix_bytes,
        }
    }
}

/// A full dump across every tracked inode and fd, per §6's "Dump surface".
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize))]
pub struct CacheStats {
    /// One entry per tracked inode.
    pub inodes: Vec<InodeSnapshot>,
    /// One entry per open fd.
    pub fds: Vec<FdSnapshot>,
}
