//! Phase B of the scheduler: merges adjacent small writes into a single
//! downstream buffer.

use bytes::BytesMut;

use crate::inode_queue::InodeQueueState;
use crate::request::{Request, WriteFlags};

/// A write absorbed into a holder's buffer, retained in `passive` so its
/// caller-facing refcount bookkeeping still resolves once the holder's
/// downstream reply lands.
#[derive(Clone)]
pub struct PassiveEntry {
    /// The absorbed request; no longer independently shippable.
    pub absorbed: Request,
    /// The request whose buffer now contains the absorbed bytes.
    pub holder: Request,
}

fn page_bound() -> usize {
    page_size::get()
}

/// Two writes are mergeable when they share `(fd, owner)`, form contiguous
/// offsets, neither has already been shipped, and both have been marked
/// `write_behind` by Phase A.
fn mergeable(prev: &Request, next: &Request) -> bool {
    prev.with_kind(|p| {
        next.with_kind(|n| match (p, n) {
            (
                crate::request::OpKind::Write {
                    fh: pfh,
                    offset: poff,
                    buf: pbuf,
                    owner: powner,
                    flags: pflags,
                },
                crate::request::OpKind::Write {
                    fh: nfh,
                    offset: noff,
                    owner: nowner,
                    flags: nflags,
                    ..
                },
            ) => {
                pfh == nfh
                    && powner == nowner
                    && !pflags.contains(WriteFlags::STACK_WOUND)
                    && !nflags.contains(WriteFlags::STACK_WOUND)
                    && pflags.contains(WriteFlags::WRITE_BEHIND)
                    && nflags.contains(WriteFlags::WRITE_BEHIND)
                    && *noff == *poff + pbuf.len() as i64
            }
            _ => false,
        })
    })
}

/// Runs Phase B over `state.active`: collapses maximal runs of adjacent,
/// mergeable writes into a single holder per run, bounded by one page.
/// Absorbed requests are unlinked from `active`, have their refcount
/// decremented once, and are recorded in `passive`.
pub(crate) fn collapse_write_bufs(state: &mut InodeQueueState) -> Vec<PassiveEntry> {
    let mut passive = Vec::new();
    let mut i = 0;
    while i < state.active.len() {
        if !state.active[i].is_write() {
            i += 1;
            continue;
        }
        let mut run_end = i + 1;
        while run_end < state.active.len() {
            let room_left = page_bound().saturating_sub(state.active[i].size() as usize);
            if room_left == 0 {
                break;
            }
            let next_size = state.active[run_end].size() as usize;
            if next_size > room_left {
                break;
            }
            if !mergeable(&state.active[i], &state.active[run_end]) {
                break;
            }
            run_end += 1;
        }
        if run_end > i + 1 {
            let holder = state.active[i].clone();
            holder.with_kind_mut(|k| {
                if let crate::request::OpKind::Write { buf, flags, .. } = k {
                    if flags.contains(WriteFlags::VIRGIN) {
                        let mut owned = BytesMut::with_capacity(page_bound());
                        owned.extend_from_slice(buf);
                        *buf = owned;
                        flags.remove(WriteFlags::VIRGIN);
                    }
                }
            });
            for absorbed in state.active.drain(i + 1..run_end) {
                holder.with_kind_mut(|hk| {
                    absorbed.with_kind(|ak| {
                        if let (
                            crate::request::OpKind::Write { buf: hbuf, .. },
                            crate::request::OpKind::Write { buf: abuf, .. },
                        ) = (hk, ak)
                        {
                            hbuf.extend_from_slice(abuf);
                        }
                    });
                });
                if absorbed.release() {
                    log::trace!(
                        "coalescer: absorbed write on {} reached refcount zero at merge time",
                        absorbed.ino()
                    );
                }
                let entry = PassiveEntry {
                    absorbed,
                    holder: holder.clone(),
                };
                state.passive.push(entry.clone());
                passive.push(entry);
            }
        }
        i += 1;
    }
    passive
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::ids::{Fh, Ino, LockOwner};
    use crate::inode_queue::InodeQueue;
    use crate::request::WriteFlags;

    fn mark_write_behind(req: &Request) {
        req.insert_write_flag(WriteFlags::WRITE_BEHIND);
    }

    #[test]
    fn contiguous_same_owner_writes_collapse() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        let a = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"AAAA"[..]), LockOwner(0));
        let b = q.enqueue_write(Fh(1), 4, BytesMut::from(&b"BBBB"[..]), LockOwner(0));
        mark_write_behind(&a);
        mark_write_behind(&b);
        let mut state = q.lock();
        let passive = collapse_write_bufs(&mut state);
        assert_eq!(passive.len(), 1);
        assert_eq!(state.active.len(), 1);
        assert_eq!(state.active[0].size(), 8);
    }

    #[test]
    fn non_contiguous_writes_do_not_collapse() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        let a = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"AAAA"[..]), LockOwner(0));
        let b = q.enqueue_write(Fh(1), 8, BytesMut::from(&b"BBBB"[..]), LockOwner(0));
        mark_write_behind(&a);
        mark_write_behind(&b);
        let mut state = q.lock();
        let passive = collapse_write_bufs(&mut state);
        assert!(passive.is_empty());
        assert_eq!(state.active.len(), 2);
    }

    #[test]
    fn different_owners_do_not_collapse() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        let a = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"AAAA"[..]), LockOwner(0));
        let b = q.enqueue_write(Fh(1), 4, BytesMut::from(&b"BBBB"[..]), LockOwner(1));
        mark_write_behind(&a);
        mark_write_behind(&b);
        let mut state = q.lock();
        let passive = collapse_write_bufs(&mut state);
        assert!(passive.is_empty());
        assert_eq!(state.active.len(), 2);
    }
}
