//! The public operation surface (§2, §4.6–§4.10): entry points for every
//! supported filesystem op, plus the glue that acts on a scheduler pass's
//! three action sets once `InodeQueue.lock` has been released.
//!
//! `Cache` is the handle application code holds. It is cheap to clone —
//! clones share the same inode/fd tables and downstream collaborator —
//! the way the teacher's own `Session` is handed around as an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::completion;
use crate::config::CacheConfig;
use crate::dispatch::{self, BackingStore, DownstreamOp, DownstreamReply, ReplyPayload, WriteBatch};
use crate::error::Errno;
use crate::file_state::{FileOpenFlags, FileState};
use crate::ids::{Fh, Ino, LockOwner};
use crate::inode_queue::InodeQueue;
use crate::request::{OpKind, Request, ReplySink, SetattrArgs};
use crate::scheduler::{self, ScheduleResult};
use crate::stats::{CacheStats, FdSnapshot, InodeSnapshot};

struct CacheInner {
    config: Mutex<CacheConfig>,
    backing: Arc<dyn BackingStore>,
    inodes: Mutex<HashMap<Ino, InodeQueue>>,
    files: Mutex<HashMap<Fh, Arc<FileState>>>,
}

/// The write-behind cache core's public handle. One instance per mounted
/// filesystem; owns no global state (§9: "None in the core; each instance
/// carries its own `conf`").
#[derive(Clone)]
pub struct Cache(Arc<CacheInner>);

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("inodes", &self.0.inodes.lock().len())
            .field("files", &self.0.files.lock().len())
            .finish()
    }
}

impl Cache {
    /// Builds a new cache instance over `backing`, the downstream
    /// collaborator every shipped write and resumed non-write op is
    /// forwarded to.
    #[must_use]
    pub fn new(config: CacheConfig, backing: Arc<dyn BackingStore>) -> Cache {
        Cache(Arc::new(CacheInner {
            config: Mutex::new(config),
            backing,
            inodes: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
        }))
    }

    fn config(&self) -> CacheConfig {
        self.0.config.lock().clone()
    }

    /// Live-reconfigures the window (`cache-size`) limit, both for future
    /// inodes and every inode currently tracked.
    pub fn set_window_size(&self, bytes: u64) {
        self.0.config.lock().set_window_size(bytes);
        let window = self.config().window_size();
        for queue in self.0.inodes.lock().values() {
            queue.set_window_conf(window);
        }
    }

    fn file_state_for(&self, fh: Fh) -> Option<Arc<FileState>> {
        self.0.files.lock().get(&fh).cloned()
    }

    fn flags_for(&self, fh: Fh) -> FileOpenFlags {
        self.file_state_for(fh)
            .map(|fs| fs.flags())
            .unwrap_or_else(FileOpenFlags::empty)
    }

    fn queue_for(&self, ino: Ino) -> Option<InodeQueue> {
        self.0.inodes.lock().get(&ino).cloned()
    }

    fn queue_or_create(&self, ino: Ino) -> InodeQueue {
        let config = self.config();
        self.0
            .inodes
            .lock()
            .entry(ino)
            .or_insert_with(|| InodeQueue::new(ino, &config))
            .clone()
    }

    /// §4.10 `open`: records file state derived from the caller's open
    /// flags. Caching starts disabled when `DIRECT`, when opened
    /// read-only, or when opened `SYNC` and `enable-O_SYNC` is on. A
    /// `SYNC` open additionally disables caching on every other fd
    /// already open against the same inode (SYNC propagates).
    pub fn open(&self, ino: Ino, fh: Fh, flags: FileOpenFlags, read_only: bool) {
        let config = self.config();
        let fs = Arc::new(FileState::new(
            ino,
            fh,
            flags,
            read_only,
            config.enable_o_sync(),
            config.disable_for_first_nbytes(),
        ));
        if flags.contains(FileOpenFlags::SYNC) && config.enable_o_sync() {
            for other in self.0.files.lock().values() {
                if other.ino() == ino {
                    other.set_disabled(true);
                }
            }
        }
        self.0.files.lock().insert(fh, fs);
    }

    /// §4.10 `create`: records file state and lazily materializes the
    /// inode queue so the first write on a brand-new file has somewhere
    /// to enqueue into.
    pub fn create(&self, ino: Ino, fh: Fh, flags: FileOpenFlags) {
        self.open(ino, fh, flags, false);
        self.queue_or_create(ino);
    }

    /// Drops a closed fd's file state. Not named in §4 directly, but
    /// required so `files` does not grow without bound across the
    /// lifetime of a long-running mount.
    pub fn release(&self, fh: Fh) {
        self.0.files.lock().remove(&fh);
    }

    /// §4.8: the write entry point.
    pub fn write(
        &self,
        ino: Ino,
        fh: Fh,
        offset: i64,
        buf: BytesMut,
        owner: LockOwner,
        reply: ReplySink,
    ) {
        let Some(file_state) = self.file_state_for(fh) else {
            reply(-1, Errno::EINVAL.0, ReplyPayload::None);
            return;
        };
        let Some(queue) = self.queue_for(ino) else {
            reply(-1, Errno::EBADFD.0, ReplyPayload::None);
            return;
        };

        if file_state.should_bypass() {
            self.bypass_write(ino, fh, offset, buf, owner, file_state, reply);
            return;
        }

        let latched = {
            let mut state = queue.lock();
            state.take_latched_error()
        };
        if !latched.is_ok() {
            reply(-1, latched.0, ReplyPayload::None);
            return;
        }

        let req = queue.enqueue_write_with_reply(fh, offset, buf, owner, reply);
        log::trace!("write: enqueued seq={} on {}", req.seq(), ino);
        self.run_scheduler(&queue);
    }

    /// §4.8 step 2: a write that bypasses the cache entirely, forwarded
    /// synchronously (from the cache's point of view — the backing store
    /// may still reply asynchronously) and never touching the queue.
    fn bypass_write(
        &self,
        ino: Ino,
        fh: Fh,
        offset: i64,
        buf: BytesMut,
        owner: LockOwner,
        file_state: Arc<FileState>,
        reply: ReplySink,
    ) {
        let size = buf.len() as u64;
        file_state.account_bypass_write(size);
        let req = Request::new_write(ino, std::sync::Weak::new(), 0, fh, offset, buf, owner);
        let mut writes = SmallVec::new();
        writes.push(req);
        let batch = WriteBatch {
            fh,
            owner,
            offset,
            writes,
            total_len: size,
            flags: file_state.flags(),
        };
        self.0.backing.forward(
            DownstreamOp::Write(batch),
            Box::new(move |dreply| {
                if dreply.is_error() {
                    reply(-1, dreply.op_errno, ReplyPayload::None);
                } else {
                    reply(size as i64, 0, ReplyPayload::None);
                }
            }),
        );
    }

    /// §4.9: `read`.
    pub fn read(&self, ino: Ino, fh: Fh, offset: i64, size: u32, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Read { fh, offset, size }, reply);
    }

    /// §4.9: `stat`.
    pub fn stat(&self, ino: Ino, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Stat, reply);
    }

    /// §4.9: `fstat`.
    pub fn fstat(&self, ino: Ino, fh: Fh, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Fstat { fh }, reply);
    }

    /// §4.9: `truncate`.
    pub fn truncate(&self, ino: Ino, size: u64, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Truncate { size }, reply);
    }

    /// §4.9: `ftruncate`.
    pub fn ftruncate(&self, ino: Ino, fh: Fh, size: u64, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Ftruncate { fh, size }, reply);
    }

    /// §4.9: `setattr`.
    pub fn setattr(&self, ino: Ino, fh: Option<Fh>, args: SetattrArgs, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Setattr { fh, args }, reply);
    }

    /// §4.9: `flush`. When `flush-behind` is configured, acknowledges
    /// immediately after the scheduler runs, surfacing whatever error is
    /// currently latched; the real downstream flush proceeds in the
    /// background once earlier writes clear the barrier.
    pub fn flush(&self, ino: Ino, fh: Fh, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Flush { fh }, reply);
    }

    /// §4.9: `fsync`. Always waits for the real downstream reply; shares
    /// `flush`'s role as a latched-error-clearing surfacing point.
    pub fn fsync(&self, ino: Ino, fh: Fh, datasync: bool, reply: ReplySink) {
        self.enqueue_non_write(ino, OpKind::Fsync { fh, datasync }, reply);
    }

    fn enqueue_non_write(&self, ino: Ino, kind: OpKind, reply: ReplySink) {
        let Some(queue) = self.queue_for(ino) else {
            reply(-1, Errno::EBADFD.0, ReplyPayload::None);
            return;
        };
        let req = queue.enqueue_non_write_with_reply(kind, reply);
        log::trace!("non-write: enqueued seq={} on {}", req.seq(), ino);
        self.run_scheduler(&queue);
    }

    /// Runs `process_queue` once and acts on every action set it produces.
    fn run_scheduler(&self, queue: &InodeQueue) {
        let config = self.config();
        let schedule = scheduler::process_queue(queue, &config, &|fh| self.file_state_for(fh));
        self.act_on_schedule(queue, schedule);
    }

    /// §4.6/§4.4/§4.7: acknowledges, ships, and resumes every request in
    /// `schedule`, with `InodeQueue.lock` held by none of this (§5: "the
    /// core never blocks under a lock").
    fn act_on_schedule(&self, queue: &InodeQueue, schedule: ScheduleResult) {
        let ScheduleResult {
            to_ack,
            to_ship,
            to_resume,
            passive: _,
        } = schedule;

        let mut rerun = false;
        for req in &to_ack {
            let size = req.size() as i64;
            req.deliver(size, 0, ReplyPayload::None);
            let freed = {
                let mut state = queue.lock();
                let freed = req.release();
                state.active.retain(|r| r.refcount() > 0);
                freed
            };
            if freed {
                rerun = true;
            }
        }
        if rerun {
            self.run_scheduler(queue);
        }

        if !to_ship.is_empty() {
            let config = self.config();
            let batches = dispatch::build_batches(&to_ship, &config, &|fh| self.flags_for(fh));
            for batch in batches {
                self.ship_batch(queue, batch);
            }
        }

        for req in to_resume {
            self.resume_one(queue.clone(), req);
        }
    }

    fn ship_batch(&self, queue: &InodeQueue, batch: WriteBatch) {
        log::trace!(
            "shipping batch: fh={} offset={} bytes={}",
            batch.fh,
            batch.offset,
            batch.total_len
        );
        let batch_for_completion = batch.clone();
        let cache = self.clone();
        let queue = queue.clone();
        self.0.backing.forward(
            DownstreamOp::Write(batch),
            Box::new(move |dreply| {
                let config = cache.config();
                let report = completion::complete_batch(
                    &queue,
                    &batch_for_completion,
                    dreply,
                    &config,
                    &|fh| cache.file_state_for(fh),
                );
                for direct in &report.direct {
                    if !direct.error.is_ok() {
                        log::warn!("write on {} failed: {}", direct.request.ino(), direct.error);
                    }
                }
                cache.act_on_schedule(&queue, report.schedule);
            }),
        );
    }

    /// §4.7: the resume path. Builds the downstream op this non-write
    /// carries, forwards it, and on reply delivers the outcome to the
    /// original caller, releases the final reference, and re-runs the
    /// scheduler.
    fn resume_one(&self, queue: InodeQueue, req: Request) {
        let is_flush = req.with_kind(|k| matches!(k, OpKind::Flush { .. }));
        let is_fsync = req.with_kind(|k| matches!(k, OpKind::Fsync { .. }));
        let is_surfacing = is_flush || is_fsync;
        let op = req.with_kind(to_downstream_op);
        let flush_behind = is_flush && self.config().flush_behind();

        let cache = self.clone();
        let queue_for_cb = queue.clone();
        let req_for_cb = req.clone();

        if flush_behind {
            let pre = {
                let mut state = queue.lock();
                state.take_latched_error()
            };
            req.deliver(
                if pre.is_ok() { 0 } else { -1 },
                pre.0,
                ReplyPayload::None,
            );
            self.0.backing.forward(
                op,
                Box::new(move |dreply| {
                    if dreply.is_error() {
                        queue_for_cb.lock().latch_error(Errno(dreply.op_errno));
                    }
                    cache.finish_resume(&queue_for_cb, &req_for_cb);
                }),
            );
            return;
        }

        self.0.backing.forward(
            op,
            Box::new(move |dreply| {
                let mut merged = None;
                if is_surfacing {
                    let pre = {
                        let mut state = queue_for_cb.lock();
                        state.take_latched_error()
                    };
                    if !pre.is_ok() {
                        merged = Some(pre);
                    }
                }
                if merged.is_none() && dreply.is_error() {
                    merged = Some(Errno(dreply.op_errno));
                }
                match merged {
                    Some(err) => req_for_cb.deliver(-1, err.0, ReplyPayload::None),
                    None => req_for_cb.deliver(dreply.op_ret, 0, dreply.payload),
                }
                cache.finish_resume(&queue_for_cb, &req_for_cb);
            }),
        );
    }

    fn finish_resume(&self, queue: &InodeQueue, req: &Request) {
        {
            let mut state = queue.lock();
            req.release();
            state.active.retain(|r| r.refcount() > 0);
        }
        self.run_scheduler(queue);
    }

    /// §6's "Dump surface": a full snapshot across every tracked inode and
    /// open fd.
    #[must_use]
    pub fn dump(&self) -> CacheStats {
        let inodes = self
            .0
            .inodes
            .lock()
            .iter()
            .map(|(ino, queue)| InodeSnapshot::of(*ino, queue))
            .collect();
        let fds = self
            .0
            .files
            .lock()
            .values()
            .map(|fs| {
                FdSnapshot::of(
                    fs.fh(),
                    fs.flags(),
                    fs.disabled(),
                    fs.disable_prefix_bytes(),
                )
            })
            .collect();
        CacheStats { inodes, fds }
    }
}

fn to_downstream_op(kind: &OpKind) -> DownstreamOp {
    match kind {
        OpKind::Read { fh, offset, size } => DownstreamOp::Read {
            fh: *fh,
            offset: *offset,
            size: *size,
        },
        OpKind::Stat => DownstreamOp::Stat,
        OpKind::Fstat { fh } => DownstreamOp::Fstat { fh: *fh },
        OpKind::Truncate { size } => DownstreamOp::Truncate { size: *size },
        OpKind::Ftruncate { fh, size } => DownstreamOp::Ftruncate {
            fh: *fh,
            size: *size,
        },
        OpKind::Setattr { fh, args } => DownstreamOp::Setattr {
            fh: *fh,
            args: args.clone(),
        },
        OpKind::Flush { fh } => DownstreamOp::Flush { fh: *fh },
        OpKind::Fsync { fh, datasync } => DownstreamOp::Fsync {
            fh: *fh,
            datasync: *datasync,
        },
        OpKind::Write { .. } => unreachable!("resume only applies to non-write requests"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DownstreamCallback;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// An in-memory backing store: every write/non-write just succeeds
    /// with the requested size, synchronously, from whichever thread
    /// called `forward`. Enough to drive the surface's entry points and
    /// observe ordering without a real downstream transport.
    #[derive(Default)]
    struct MockStore {
        writes_seen: StdMutex<Vec<(Fh, i64, u64)>>,
        fail_next: AtomicI32,
    }

    impl MockStore {
        fn fail_next_with(&self, errno: i32) {
            self.fail_next.store(errno, Ordering::SeqCst);
        }
    }

    impl BackingStore for MockStore {
        fn forward(&self, op: DownstreamOp, callback: DownstreamCallback) {
            let errno = self.fail_next.swap(0, Ordering::SeqCst);
            if errno != 0 {
                callback(DownstreamReply::err(errno));
                return;
            }
            match op {
                DownstreamOp::Write(batch) => {
                    self.writes_seen
                        .lock()
                        .unwrap()
                        .push((batch.fh, batch.offset, batch.total_len));
                    callback(DownstreamReply {
                        op_ret: batch.total_len as i64,
                        op_errno: 0,
                        payload: ReplyPayload::None,
                    });
                }
                DownstreamOp::Read { size, .. } => {
                    callback(DownstreamReply {
                        op_ret: i64::from(size),
                        op_errno: 0,
                        payload: ReplyPayload::Data(bytes::Bytes::new()),
                    });
                }
                _ => callback(DownstreamReply::ok()),
            }
        }
    }

    fn cache_with(store: Arc<MockStore>) -> Cache {
        Cache::new(CacheConfig::new(), store)
    }

    fn open_file(cache: &Cache, ino: Ino, fh: Fh) {
        cache.create(ino, fh, FileOpenFlags::empty());
    }

    #[test]
    fn write_is_acknowledged_when_window_allows() {
        let store = Arc::new(MockStore::default());
        let cache = cache_with(store.clone());
        open_file(&cache, Ino(1), Fh(1));

        let acked = Arc::new(AtomicI32::new(-1));
        let acked2 = acked.clone();
        cache.write(
            Ino(1),
            Fh(1),
            0,
            BytesMut::from(&b"hello"[..]),
            LockOwner(0),
            Box::new(move |ret, _errno, _payload| {
                acked2.store(ret as i32, Ordering::SeqCst);
            }),
        );
        assert_eq!(acked.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn write_entry_surfaces_and_clears_latched_error() {
        let store = Arc::new(MockStore::default());
        let cache = cache_with(store.clone());
        open_file(&cache, Ino(1), Fh(1));

        // First write ships (trickling is on by default) and fails.
        store.fail_next_with(libc::ENOSPC);
        cache.write(
            Ino(1),
            Fh(1),
            0,
            BytesMut::from(&b"AAAA"[..]),
            LockOwner(0),
            Box::new(|_ret, _errno, _payload| {}),
        );

        let seen_errno = Arc::new(AtomicI32::new(0));
        let seen_errno2 = seen_errno.clone();
        cache.write(
            Ino(1),
            Fh(1),
            4,
            BytesMut::from(&b"BBBB"[..]),
            LockOwner(0),
            Box::new(move |_ret, errno, _payload| {
                seen_errno2.store(errno, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen_errno.load(Ordering::SeqCst), libc::ENOSPC);

        // Latch was cleared by the surfacing write above.
        let seen_errno3 = Arc::new(AtomicI32::new(-1));
        let seen_errno4 = seen_errno3.clone();
        cache.write(
            Ino(1),
            Fh(1),
            8,
            BytesMut::from(&b"CCCC"[..]),
            LockOwner(0),
            Box::new(move |_ret, errno, _payload| {
                seen_errno4.store(errno, Ordering::SeqCst);
            }),
        );
        assert_eq!(seen_errno3.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bypass_write_never_touches_the_queue() {
        let store = Arc::new(MockStore::default());
        let cache = cache_with(store.clone());
        cache.open(Ino(1), Fh(1), FileOpenFlags::DIRECT, false);

        let acked = Arc::new(AtomicI32::new(-1));
        let acked2 = acked.clone();
        cache.write(
            Ino(1),
            Fh(1),
            0,
            BytesMut::from(&b"hi"[..]),
            LockOwner(0),
            Box::new(move |ret, _errno, _payload| {
                acked2.store(ret as i32, Ordering::SeqCst);
            }),
        );
        assert_eq!(acked.load(Ordering::SeqCst), 2);
        assert_eq!(store.writes_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn flush_waits_for_prior_writes_when_not_flush_behind() {
        let store = Arc::new(MockStore::default());
        let config = CacheConfig::new().with_flush_behind(false);
        let cache = Cache::new(config, store.clone());
        open_file(&cache, Ino(1), Fh(1));

        cache.write(
            Ino(1),
            Fh(1),
            0,
            BytesMut::from(&b"data"[..]),
            LockOwner(0),
            Box::new(|_ret, _errno, _payload| {}),
        );

        let flushed = Arc::new(AtomicI32::new(-1));
        let flushed2 = flushed.clone();
        cache.fsync(
            Ino(1),
            Fh(1),
            false,
            Box::new(move |ret, _errno, _payload| {
                flushed2.store(ret as i32, Ordering::SeqCst);
            }),
        );
        assert_eq!(flushed.load(Ordering::SeqCst), 0);
        assert_eq!(store.writes_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn dump_reports_tracked_inode() {
        let store = Arc::new(MockStore::default());
        let cache = cache_with(store);
        open_file(&cache, Ino(42), Fh(1));
        let stats = cache.dump();
        assert_eq!(stats.inodes.len(), 1);
        assert_eq!(stats.inodes[0].ino, Ino(42));
    }
}
