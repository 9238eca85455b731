//! Per-inode request queue and accounting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard};

use crate::coalescer::PassiveEntry;
use crate::config::CacheConfig;
use crate::error::{self, Errno};
use crate::ids::{Fh, Ino, LockOwner};
use crate::request::{OpKind, Request, ReplySink};

/// The mutable state protected by `InodeQueue.lock`. Kept as a bare struct
/// (not hidden behind accessor methods) so the scheduler can manipulate
/// several fields atomically in one critical section, per §5's "the only
/// work done under `InodeQueue.lock` is list manipulation, counter update,
/// and predicate evaluation."
pub(crate) struct InodeQueueState {
    /// Ordered list of requests, insertion-order preserved, oldest at head.
    pub active: VecDeque<Request>,
    /// Requests whose buffers were absorbed into a coalesced holder;
    /// retained only for refcount bookkeeping until the holder's downstream
    /// reply lands.
    pub passive: Vec<PassiveEntry>,
    /// Sum of `size` over queued writes not yet picked for shipping.
    pub aggregate_current: u64,
    /// Sum of `size` over writes acknowledged but not yet confirmed.
    pub window_current: u64,
    /// Configured window limit (mirrors the live-reconfigurable
    /// `cache-size`).
    pub window_conf: u64,
    /// Sticky `(code, errno)`, reset only when surfaced.
    pub latched_error: Errno,
}

impl InodeQueueState {
    /// Latches `err`, overwriting whatever is already latched only if `err`
    /// outranks it (§7: "subsequent errors while a latch is set are
    /// overwritten only if more severe"); otherwise the existing latch is
    /// preserved across reschedules until surfaced (§9).
    pub fn latch_error(&mut self, err: Errno) {
        if err.severity() > self.latched_error.severity() {
            self.latched_error = err;
        }
    }

    /// Takes and clears the latched error, surfacing it to the caller of a
    /// surfacing op (write entry, flush, fsync).
    pub fn take_latched_error(&mut self) -> Errno {
        std::mem::replace(&mut self.latched_error, error::OK)
    }
}

/// Internals behind the `Arc` every [`Request`] in this inode's lists
/// keeps a non-owning [`Weak`] pointer to.
pub(crate) struct InodeQueueInner {
    pub ino: Ino,
    state: Mutex<InodeQueueState>,
    next_seq: AtomicU64,
}

impl InodeQueueInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, InodeQueueState> {
        self.state.lock()
    }
}

/// Per-inode queue handle. Cheap to clone; clones share the same
/// underlying state.
#[derive(Clone)]
pub struct InodeQueue(Arc<InodeQueueInner>);

impl InodeQueue {
    /// Creates a fresh, empty queue for `ino` using the window limit from
    /// `config`.
    #[must_use]
    pub fn new(ino: Ino, config: &CacheConfig) -> InodeQueue {
        InodeQueue(Arc::new(InodeQueueInner {
            ino,
            state: Mutex::new(InodeQueueState {
                active: VecDeque::new(),
                passive: Vec::new(),
                aggregate_current: 0,
                window_current: 0,
                window_conf: config.window_size(),
                latched_error: error::OK,
            }),
            next_seq: AtomicU64::new(0),
        }))
    }

    pub(crate) fn inner(&self) -> &Arc<InodeQueueInner> {
        &self.0
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, InodeQueueState> {
        self.0.state.lock()
    }

    fn next_seq(&self) -> u64 {
        self.0.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a new write to `active` with its initial refcount of two and
    /// `VIRGIN` set, returning the handle.
    pub fn enqueue_write(
        &self,
        fh: Fh,
        offset: i64,
        buf: BytesMut,
        owner: LockOwner,
    ) -> Request {
        let seq = self.next_seq();
        let req = Request::new_write(
            self.0.ino,
            Arc::downgrade(&self.0),
            seq,
            fh,
            offset,
            buf,
            owner,
        );
        let mut state = self.lock();
        state.aggregate_current += req.size();
        state.active.push_back(req.clone());
        req
    }

    /// As [`enqueue_write`](Self::enqueue_write), but registers `reply` as
    /// the sink that eventually delivers this write's outcome to its
    /// original caller.
    pub fn enqueue_write_with_reply(
        &self,
        fh: Fh,
        offset: i64,
        buf: BytesMut,
        owner: LockOwner,
        reply: ReplySink,
    ) -> Request {
        let seq = self.next_seq();
        let req = Request::new_write_with_reply(
            self.0.ino,
            Arc::downgrade(&self.0),
            seq,
            fh,
            offset,
            buf,
            owner,
            reply,
        );
        let mut state = self.lock();
        state.aggregate_current += req.size();
        state.active.push_back(req.clone());
        req
    }

    /// Appends a new non-write to `active` with its initial refcount of one,
    /// setting `FLUSH_ALL` on every write currently queued so the next
    /// scheduler pass does not wait for the aggregate threshold.
    pub fn enqueue_non_write(&self, kind: OpKind) -> Request {
        self.enqueue_non_write_with_reply(kind, Box::new(|_ret, _errno, _payload| {}))
    }

    /// As [`enqueue_non_write`](Self::enqueue_non_write), but registers
    /// `reply` as the sink invoked by the resume path once this op's
    /// downstream reply lands.
    pub fn enqueue_non_write_with_reply(&self, kind: OpKind, reply: ReplySink) -> Request {
        let seq = self.next_seq();
        let req =
            Request::new_non_write_with_reply(self.0.ino, Arc::downgrade(&self.0), seq, kind, reply);
        let mut state = self.lock();
        for existing in &state.active {
            if existing.is_write() {
                existing.insert_write_flag(crate::request::WriteFlags::FLUSH_ALL);
            }
        }
        state.active.push_back(req.clone());
        req
    }

    /// Window limit currently in effect.
    #[must_use]
    pub fn window_conf(&self) -> u64 {
        self.lock().window_conf
    }

    /// Live-reconfigures the window limit.
    pub fn set_window_conf(&self, bytes: u64) {
        self.lock().window_conf = bytes;
    }

    /// Snapshot of `(aggregate_current, window_current)`, for diagnostics
    /// and tests.
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        let state = self.lock();
        (state.aggregate_current, state.window_current)
    }

    /// Number of requests currently linked into `active`.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    #[test]
    fn enqueue_write_updates_aggregate() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        q.enqueue_write(Fh(1), 0, BytesMut::from(&b"0123456789"[..]), LockOwner(0));
        assert_eq!(q.counters().0, 10);
    }

    #[test]
    fn enqueue_non_write_sets_flush_all_on_pending_writes() {
        let q = InodeQueue::new(Ino(1), &CacheConfig::new());
        let w = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"x"[..]), LockOwner(0));
        assert!(!w.write_flags().contains(crate::request::WriteFlags::FLUSH_ALL));
        q.enqueue_non_write(OpKind::Stat);
        assert!(w.write_flags().contains(crate::request::WriteFlags::FLUSH_ALL));
    }

    #[test]
    fn latch_error_keeps_first_error_when_not_more_severe() {
        let mut state = InodeQueueState {
            active: VecDeque::new(),
            passive: Vec::new(),
            aggregate_current: 0,
            window_current: 0,
            window_conf: 0,
            latched_error: error::OK,
        };
        state.latch_error(Errno(libc::ENOSPC));
        state.latch_error(Errno::EIO);
        assert_eq!(state.latched_error, Errno(libc::ENOSPC));
    }

    #[test]
    fn latch_error_is_overwritten_by_a_more_severe_one() {
        let mut state = InodeQueueState {
            active: VecDeque::new(),
            passive: Vec::new(),
            aggregate_current: 0,
            window_current: 0,
            window_conf: 0,
            latched_error: error::OK,
        };
        state.latch_error(Errno(libc::ENOSPC));
        state.latch_error(Errno::ENOMEM);
        assert_eq!(state.latched_error, Errno::ENOMEM);
    }

    #[test]
    fn latch_error_does_not_overwrite_with_a_less_severe_one() {
        let mut state = InodeQueueState {
            active: VecDeque::new(),
            passive: Vec::new(),
            aggregate_current: 0,
            window_current: 0,
            window_conf: 0,
            latched_error: error::OK,
        };
        state.latch_error(Errno::ENOMEM);
        state.latch_error(Errno::EIO);
        assert_eq!(state.latched_error, Errno::ENOMEM);
    }
}
