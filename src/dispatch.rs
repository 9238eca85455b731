//! The backing-store interface and the sync dispatcher that groups shipped
//! writes into downstream batches (§4.4).

use std::time::SystemTime;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::config::{CacheConfig, MAX_VECTOR_COUNT};
use crate::file_state::FileOpenFlags;
use crate::ids::{Fh, LockOwner};
use crate::request::{OpKind, Request, SetattrArgs};

/// One grouped downstream write call: a contiguous, same-`(fd, owner)` run
/// of shipped writes.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    /// Target fd.
    pub fh: Fh,
    /// Lock-owner common to every write in the batch.
    pub owner: LockOwner,
    /// Byte offset of the batch's first byte.
    pub offset: i64,
    /// Member requests, in offset order. Each holds one logical reference
    /// released by the completion handler.
    pub writes: SmallVec<[Request; MAX_VECTOR_COUNT]>,
    /// Total payload bytes across the batch.
    pub total_len: u64,
    /// Open flags of the fd, so the backing store can honor `O_SYNC`
    /// semantics if it wants to.
    pub flags: FileOpenFlags,
}

impl WriteBatch {
    /// Concatenates every member's buffer in offset order, satisfying the
    /// coalescing-idempotence law in §8.
    #[must_use]
    pub fn concatenated_payload(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.total_len as usize);
        for req in &self.writes {
            req.with_kind(|k| {
                if let OpKind::Write { buf, .. } = k {
                    out.extend_from_slice(buf);
                }
            });
        }
        Bytes::from(out)
    }
}

/// One operation forwarded to the backing store.
#[derive(Debug)]
pub enum DownstreamOp {
    /// A grouped write call.
    Write(WriteBatch),
    /// A read.
    Read { fh: Fh, offset: i64, size: u32 },
    /// `stat`.
    Stat,
    /// `fstat`.
    Fstat { fh: Fh },
    /// `truncate`.
    Truncate { size: u64 },
    /// `ftruncate`.
    Ftruncate { fh: Fh, size: u64 },
    /// `setattr`.
    Setattr {
        fh: Option<Fh>,
        args: SetattrArgs,
    },
    /// `flush`.
    Flush { fh: Fh },
    /// `fsync`.
    Fsync { fh: Fh, datasync: bool },
}

/// Minimal file attributes, for the ops that resolve with one: `stat`,
/// `fstat`, `truncate`, `ftruncate`, `setattr`. Trimmed to the fields a
/// backing store actually needs to hand back through this core; kind,
/// rdev, and the other kernel-ABI specific fields live with the
/// surrounding translator, not here.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    /// Size in bytes.
    pub size: u64,
    /// Time of last access.
    pub atime: SystemTime,
    /// Time of last modification.
    pub mtime: SystemTime,
    /// Permission bits.
    pub mode: u32,
    /// Owning uid.
    pub uid: u32,
    /// Owning gid.
    pub gid: u32,
}

/// Op-specific payload returned alongside a reply's `(op_ret, op_errno)`.
#[derive(Debug, Clone)]
pub enum ReplyPayload {
    /// No payload (writes, flush, fsync).
    None,
    /// Bytes read, for a read reply.
    Data(Bytes),
    /// Attributes, for stat/fstat/truncate/ftruncate/setattr replies.
    Attr(Attr),
}

/// A downstream reply, matching §6: `op_ret < 0` is an error; for writes,
/// `0 <= op_ret < submitted_bytes` is a short write.
#[derive(Debug)]
pub struct DownstreamReply {
    /// Negative on error, otherwise bytes-transferred (writes/reads) or
    /// zero for ops with no byte count.
    pub op_ret: i64,
    /// Valid only when `op_ret < 0`.
    pub op_errno: i32,
    /// Op-specific payload.
    pub payload: ReplyPayload,
}

impl DownstreamReply {
    /// Builds a plain success reply with no payload.
    #[must_use]
    pub fn ok() -> DownstreamReply {
        DownstreamReply {
            op_ret: 0,
            op_errno: 0,
            payload: ReplyPayload::None,
        }
    }

    /// Builds an error reply.
    #[must_use]
    pub fn err(errno: i32) -> DownstreamReply {
        DownstreamReply {
            op_ret: -1,
            op_errno: errno,
            payload: ReplyPayload::None,
        }
    }

    #[must_use]
    pub(crate) fn is_error(&self) -> bool {
        self.op_ret < 0
    }
}

/// Callback through which a `forward` call reports its reply. Boxed rather
/// than generic so `BackingStore` stays object-safe, the way the teacher's
/// own `ReplySender` trait is object-safe for the same reason.
pub type DownstreamCallback = Box<dyn FnOnce(DownstreamReply) + Send>;

/// The downstream collaborator this core consumes. Exactly the `forward(op,
/// callback)` interface from §6 — no bundled transport.
pub trait BackingStore: Send + Sync {
    /// Forwards one op downstream. Must not block; must invoke `callback`
    /// exactly once, synchronously or from another thread.
    fn forward(&self, op: DownstreamOp, callback: DownstreamCallback);
}

/// Groups an ordered `to_ship` list into one or more [`WriteBatch`]es per
/// §4.4: a new batch starts whenever fd, owner, offset-contiguity, vector
/// count, or accumulated bytes would be violated by extending the current
/// one.
#[must_use]
pub fn build_batches(
    to_ship: &[Request],
    config: &CacheConfig,
    flags_for: &dyn Fn(Fh) -> FileOpenFlags,
) -> Vec<WriteBatch> {
    let mut batches: Vec<WriteBatch> = Vec::new();

    for req in to_ship {
        let Some((fh, offset, size, owner)) = req.with_kind(|k| match k {
            OpKind::Write {
                fh,
                offset,
                buf,
                owner,
                ..
            } => Some((*fh, *offset, buf.len() as u64, *owner)),
            _ => None,
        }) else {
            continue;
        };

        let extend_current = match batches.last() {
            Some(b) => {
                b.fh == fh
                    && b.owner == owner
                    && b.offset + b.total_len as i64 == offset
                    && b.writes.len() + 1 <= MAX_VECTOR_COUNT
                    && b.total_len + size <= config.aggregate_size()
            }
            None => false,
        };

        if extend_current {
            let b = batches.last_mut().expect("checked above");
            b.writes.push(req.clone());
            b.total_len += size;
        } else {
            let mut writes = SmallVec::new();
            writes.push(req.clone());
            batches.push(WriteBatch {
                fh,
                owner,
                offset,
                writes,
                total_len: size,
                flags: flags_for(fh),
            });
        }
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::ids::Ino;
    use crate::inode_queue::InodeQueue;

    fn flags_for(_fh: Fh) -> FileOpenFlags {
        FileOpenFlags::empty()
    }

    #[test]
    fn contiguous_writes_form_one_batch() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        let a = q.enqueue_write(Fh(1), 0, bytes::BytesMut::from(&b"AAAA"[..]), LockOwner(0));
        let b = q.enqueue_write(Fh(1), 4, bytes::BytesMut::from(&b"BBBB"[..]), LockOwner(0));
        let batches = build_batches(&[a, b], &CacheConfig::new(), &flags_for);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].total_len, 8);
        assert_eq!(batches[0].concatenated_payload().as_ref(), b"AAAABBBB");
    }

    #[test]
    fn fd_change_starts_new_batch() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        let a = q.enqueue_write(Fh(1), 0, bytes::BytesMut::from(&b"AAAA"[..]), LockOwner(0));
        let b = q.enqueue_write(Fh(2), 4, bytes::BytesMut::from(&b"BBBB"[..]), LockOwner(0));
        let batches = build_batches(&[a, b], &CacheConfig::new(), &flags_for);
        assert_eq!(batches.len(), 2);
    }
}
