//! The pending operation record and its refcount discipline.
//!
//! `Request` is the immutable-except-flags record of one pending application
//! operation described in the data model: a write, a read, or one of the
//! metadata ops, wrapped in a refcounted holder and linked into its inode's
//! queue.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;
use bytes::BytesMut;

use crate::dispatch::ReplyPayload;
use crate::ids::{Fh, Ino, LockOwner};
use crate::inode_queue::InodeQueueInner;
use std::sync::Weak;

bitflags! {
    /// Mutable flags carried by a write request. All transitions happen
    /// under the owning `InodeQueue.lock`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u32 {
        /// The scheduler has picked this write for shipping downstream.
        const STACK_WOUND = 1 << 0;
        /// The write has already been acknowledged to the caller.
        const WRITE_BEHIND = 1 << 1;
        /// The downstream store has replied for this write.
        const GOT_REPLY = 1 << 2;
        /// The write's buffer has not yet been copied into an owned page.
        const VIRGIN = 1 << 3;
        /// The accumulated-size gate should be bypassed for this write.
        const FLUSH_ALL = 1 << 4;
    }
}

bitflags! {
    /// Mutable flags carried by a non-write request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NonWriteFlags: u32 {
        /// Set once the request has been handed to [`to_resume`](crate::scheduler).
        const MARKED_FOR_RESUME = 1 << 0;
    }
}

/// Arguments to `setattr`, mirroring the optional-field shape the upstream
/// caller presents: unset fields are left untouched downstream.
#[derive(Debug, Clone, Default)]
pub struct SetattrArgs {
    /// New file mode, if changed.
    pub mode: Option<u32>,
    /// New owning uid, if changed.
    pub uid: Option<u32>,
    /// New owning gid, if changed.
    pub gid: Option<u32>,
    /// New size, if this is a truncating setattr.
    pub size: Option<u64>,
    /// New access time, if changed.
    pub atime: Option<SystemTime>,
    /// New modification time, if changed.
    pub mtime: Option<SystemTime>,
}

/// The kind of operation a [`Request`] carries, matching the data model's
/// `Write | Read | Metadata{...}` split.
#[derive(Debug)]
pub enum OpKind {
    /// A write: the vector of buffer slices has already been flattened into
    /// a single owned buffer by the entry point, since the core never reads
    /// caller memory past the call that enqueues it.
    Write {
        /// Open-file handle the write targets.
        fh: Fh,
        /// Byte offset of the first byte written.
        offset: i64,
        /// Payload. Grows in place when the coalescer absorbs a neighbor.
        buf: BytesMut,
        /// Lock-owner identity; writes with different owners never merge.
        owner: LockOwner,
        /// Mutable write-specific flags.
        flags: WriteFlags,
    },
    /// A read.
    Read {
        /// Open-file handle the read targets.
        fh: Fh,
        /// Byte offset to read from.
        offset: i64,
        /// Number of bytes requested.
        size: u32,
    },
    /// `stat` on the inode directly (no fd).
    Stat,
    /// `fstat` on an open fd.
    Fstat {
        /// Open-file handle.
        fh: Fh,
    },
    /// `truncate` on the inode directly (no fd).
    Truncate {
        /// New size.
        size: u64,
    },
    /// `ftruncate` on an open fd.
    Ftruncate {
        /// Open-file handle.
        fh: Fh,
        /// New size.
        size: u64,
    },
    /// `setattr`.
    Setattr {
        /// Open-file handle, if the setattr arrived through one.
        fh: Option<Fh>,
        /// Field-level arguments.
        args: SetattrArgs,
    },
    /// `flush`.
    Flush {
        /// Open-file handle being flushed.
        fh: Fh,
    },
    /// `fsync`.
    Fsync {
        /// Open-file handle being synced.
        fh: Fh,
        /// Whether only data (not metadata) must be synced.
        datasync: bool,
    },
}

impl OpKind {
    /// True for the `Write` variant.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, OpKind::Write { .. })
    }

    /// Total payload size in bytes; zero for non-writes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            OpKind::Write { buf, .. } => buf.len() as u64,
            _ => 0,
        }
    }

    /// Open-file handle this op was issued against, if any.
    #[must_use]
    pub fn fh(&self) -> Option<Fh> {
        match self {
            OpKind::Write { fh, .. }
            | OpKind::Read { fh, .. }
            | OpKind::Fstat { fh }
            | OpKind::Ftruncate { fh, .. }
            | OpKind::Flush { fh }
            | OpKind::Fsync { fh, .. } => Some(*fh),
            OpKind::Setattr { fh, .. } => *fh,
            OpKind::Stat | OpKind::Truncate { .. } => None,
        }
    }
}

/// The starting logical refcount for a write: one for the acknowledgement
/// path, one for the shipping path.
pub const WRITE_INITIAL_REFCOUNT: u32 = 2;
/// The starting logical refcount for a non-write: one for the resume path.
pub const NON_WRITE_INITIAL_REFCOUNT: u32 = 1;

/// The sink a caller-facing entry point registers at enqueue time, invoked
/// exactly once to deliver this request's outcome: on the acknowledgement
/// path (writes), the resume path (non-writes), or a completion handler's
/// direct-delivery pass-through (§4.5). Shaped like a downstream reply
/// (§6: "returning through a reply callback with the same shape as
/// downstream") so a caller-context adapter can treat both uniformly.
pub type ReplySink = Box<dyn FnOnce(i64, i32, ReplyPayload) + Send>;

fn no_op_reply() -> ReplySink {
    Box::new(|_ret, _errno, _payload| {})
}

struct RequestInner {
    ino: Ino,
    kind: parking_lot::Mutex<OpKind>,
    non_write_flags: AtomicU32,
    /// Logical refcount per §4.1. Distinct from `Arc::strong_count`: this is
    /// the spec-described discipline ("freed when refcount reaches zero and
    /// unlinked from all lists"), layered on top of the `Arc` allocation
    /// that actually owns the memory.
    refcount: AtomicU32,
    /// Non-owning back-reference to the owning inode queue.
    queue: Weak<InodeQueueInner>,
    seq: u64,
    reply: parking_lot::Mutex<Option<ReplySink>>,
}

/// A refcounted handle to one pending operation.
///
/// Cloning a `Request` does not acquire a logical reference by itself —
/// callers that need to hold a logical reference call [`Request::acquire`]
/// explicitly, mirroring the acquire/release discipline in §4.1. Plain
/// clones are for passing the handle around within a single logical owner.
#[derive(Clone)]
pub struct Request(Arc<RequestInner>);

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("ino", &self.0.ino)
            .field("seq", &self.0.seq)
            .field("refcount", &self.0.refcount.load(Ordering::Relaxed))
            .finish()
    }
}

impl Request {
    pub(crate) fn new_write(
        ino: Ino,
        queue: Weak<InodeQueueInner>,
        seq: u64,
        fh: Fh,
        offset: i64,
        buf: BytesMut,
        owner: LockOwner,
    ) -> Request {
        Request::new_write_with_reply(ino, queue, seq, fh, offset, buf, owner, no_op_reply())
    }

    pub(crate) fn new_write_with_reply(
        ino: Ino,
        queue: Weak<InodeQueueInner>,
        seq: u64,
        fh: Fh,
        offset: i64,
        buf: BytesMut,
        owner: LockOwner,
        reply: ReplySink,
    ) -> Request {
        let kind = OpKind::Write {
            fh,
            offset,
            buf,
            owner,
            flags: WriteFlags::VIRGIN,
        };
        Request(Arc::new(RequestInner {
            ino,
            kind: parking_lot::Mutex::new(kind),
            non_write_flags: AtomicU32::new(0),
            refcount: AtomicU32::new(WRITE_INITIAL_REFCOUNT),
            queue,
            seq,
            reply: parking_lot::Mutex::new(Some(reply)),
        }))
    }

    pub(crate) fn new_non_write(
        ino: Ino,
        queue: Weak<InodeQueueInner>,
        seq: u64,
        kind: OpKind,
    ) -> Request {
        Request::new_non_write_with_reply(ino, queue, seq, kind, no_op_reply())
    }

    pub(crate) fn new_non_write_with_reply(
        ino: Ino,
        queue: Weak<InodeQueueInner>,
        seq: u64,
        kind: OpKind,
        reply: ReplySink,
    ) -> Request {
        debug_assert!(!kind.is_write());
        Request(Arc::new(RequestInner {
            ino,
            kind: parking_lot::Mutex::new(kind),
            non_write_flags: AtomicU32::new(0),
            refcount: AtomicU32::new(NON_WRITE_INITIAL_REFCOUNT),
            queue,
            seq,
            reply: parking_lot::Mutex::new(Some(reply)),
        }))
    }

    /// The inode this request belongs to.
    #[must_use]
    pub fn ino(&self) -> Ino {
        self.0.ino
    }

    /// Monotonically increasing enqueue sequence number; `active` is kept
    /// ordered by this.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.0.seq
    }

    /// Runs `f` against the current op kind under the request's internal
    /// lock. Callers already hold `InodeQueue.lock` in every real call site;
    /// the inner lock exists only so `OpKind::Write::buf` can grow during
    /// coalescing without requiring `&mut Request`.
    pub fn with_kind<R>(&self, f: impl FnOnce(&OpKind) -> R) -> R {
        f(&self.0.kind.lock())
    }

    /// Runs `f` against the current op kind mutably.
    pub fn with_kind_mut<R>(&self, f: impl FnOnce(&mut OpKind) -> R) -> R {
        f(&mut self.0.kind.lock())
    }

    /// True if this request carries a write.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.with_kind(OpKind::is_write)
    }

    /// Current payload size (zero for non-writes).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.with_kind(OpKind::size)
    }

    /// Open-file handle this request targets, if any.
    #[must_use]
    pub fn fh(&self) -> Option<Fh> {
        self.with_kind(OpKind::fh)
    }

    /// Reads the current write flags. Panics if called on a non-write.
    #[must_use]
    pub fn write_flags(&self) -> WriteFlags {
        self.with_kind(|k| match k {
            OpKind::Write { flags, .. } => *flags,
            _ => unreachable!("write_flags called on a non-write request"),
        })
    }

    /// Inserts `flag` into the write flags. Panics if called on a non-write.
    pub fn insert_write_flag(&self, flag: WriteFlags) {
        self.with_kind_mut(|k| match k {
            OpKind::Write { flags, .. } => flags.insert(flag),
            _ => unreachable!("insert_write_flag called on a non-write request"),
        });
    }

    /// Removes `flag` from the write flags. Panics if called on a non-write.
    pub fn remove_write_flag(&self, flag: WriteFlags) {
        self.with_kind_mut(|k| match k {
            OpKind::Write { flags, .. } => flags.remove(flag),
            _ => unreachable!("remove_write_flag called on a non-write request"),
        });
    }

    /// Reads the current non-write flags. Zero for writes.
    #[must_use]
    pub fn non_write_flags(&self) -> NonWriteFlags {
        NonWriteFlags::from_bits_truncate(self.0.non_write_flags.load(Ordering::Acquire))
    }

    /// Sets `MARKED_FOR_RESUME`.
    pub fn mark_for_resume(&self) {
        self.0
            .non_write_flags
            .fetch_or(NonWriteFlags::MARKED_FOR_RESUME.bits(), Ordering::AcqRel);
    }

    /// Current logical refcount.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.0.refcount.load(Ordering::Acquire)
    }

    /// Acquires an additional logical reference. Must be called under
    /// `InodeQueue.lock`.
    pub fn acquire(&self) {
        self.0.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a logical reference. Must be called under `InodeQueue.lock`.
    /// Returns `true` if this was the last reference: the caller must unlink
    /// the request from every list it appears in.
    pub fn release(&self) -> bool {
        let prev = self.0.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "released a request with refcount already zero");
        prev == 1
    }

    /// The owning inode queue, if it has not already been torn down.
    pub(crate) fn queue(&self) -> Option<Arc<InodeQueueInner>> {
        self.0.queue.upgrade()
    }

    /// Takes the registered reply sink, leaving `None` behind so a request
    /// is delivered exactly once whichever of ack/resume/direct-delivery
    /// gets to it first.
    pub(crate) fn take_reply(&self) -> Option<ReplySink> {
        self.0.reply.lock().take()
    }

    /// Takes and invokes the reply sink with `(ret, errno, payload)`, a
    /// no-op if it was already delivered.
    pub(crate) fn deliver(&self, ret: i64, errno: i32, payload: ReplyPayload) {
        if let Some(sink) = self.take_reply() {
            sink(ret, errno, payload);
        }
    }

    /// Identity comparison by allocation, for dedup in scheduler bookkeeping.
    #[must_use]
    pub fn ptr_eq(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Fh, LockOwner};

    fn dummy_write(seq: u64) -> Request {
        Request::new_write(
            Ino(1),
            Weak::new(),
            seq,
            Fh(1),
            0,
            BytesMut::from(&b"hello"[..]),
            LockOwner(0),
        )
    }

    #[test]
    fn write_starts_at_refcount_two() {
        let req = dummy_write(0);
        assert_eq!(req.refcount(), WRITE_INITIAL_REFCOUNT);
    }

    #[test]
    fn non_write_starts_at_refcount_one() {
        let req = Request::new_non_write(Ino(1), Weak::new(), 0, OpKind::Stat);
        assert_eq!(req.refcount(), NON_WRITE_INITIAL_REFCOUNT);
    }

    #[test]
    fn release_reaches_zero_exactly_once() {
        let req = dummy_write(0);
        assert!(!req.release());
        assert!(req.release());
    }

    #[test]
    fn virgin_flag_set_on_new_write() {
        let req = dummy_write(0);
        assert!(req.write_flags().contains(WriteFlags::VIRGIN));
    }
}
