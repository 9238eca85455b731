//! Completion handler: consumes a downstream reply for a shipped batch,
//! updates accounting, latches errors, and re-runs the scheduler (§4.5).

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::dispatch::{DownstreamReply, WriteBatch};
use crate::error::Errno;
use crate::file_state::FileState;
use crate::ids::Fh;
use crate::inode_queue::{InodeQueue, InodeQueueState};
use crate::request::{Request, WriteFlags};
use crate::scheduler::{self, ScheduleResult};

/// A request whose downstream reply must be delivered straight to its
/// caller rather than through the normal acknowledgement path, because it
/// had not yet been acknowledged when the reply arrived (§4.5's
/// pass-through case).
pub struct DirectDelivery {
    /// The affected request.
    pub request: Request,
    /// The error to deliver. `Errno(0)` would never appear here; a
    /// pass-through delivery only happens on error or short write.
    pub error: Errno,
}

/// Everything the caller must act on once a downstream reply has been
/// processed: any replies that must bypass the normal ack path, plus the
/// next schedule produced by re-running the scheduler.
pub struct CompletionReport {
    /// Requests needing immediate error delivery to their original caller.
    pub direct: Vec<DirectDelivery>,
    /// The schedule computed by re-running `process_queue` afterward.
    pub schedule: ScheduleResult,
}

fn complete_one(
    state: &mut InodeQueueState,
    req: &Request,
    error: Option<Errno>,
    short: bool,
    direct: &mut Vec<DirectDelivery>,
) {
    let size = req.size();
    let was_acked = req.write_flags().contains(WriteFlags::WRITE_BEHIND);

    req.insert_write_flag(WriteFlags::GOT_REPLY);
    state.window_current = state.window_current.saturating_sub(size);

    let latched = if let Some(err) = error {
        state.latch_error(err);
        Some(err)
    } else if short {
        state.latch_error(Errno::EIO);
        Some(Errno::EIO)
    } else {
        None
    };

    // Ship-path reference, always released on reply.
    let ship_path_freed = req.release();

    if !was_acked {
        // Pass-through: phases A and C both ran before this write was ever
        // acknowledged. Its caller is still waiting synchronously; deliver
        // the outcome (success or latched error) directly and release the
        // acknowledgement-path reference ourselves, since the normal ack
        // path will never see this request (it already carries GOT_REPLY).
        match latched {
            Some(err) => req.deliver(-1, err.0, crate::dispatch::ReplyPayload::None),
            None => req.deliver(size as i64, 0, crate::dispatch::ReplyPayload::None),
        }
        direct.push(DirectDelivery {
            request: req.clone(),
            error: latched.unwrap_or(crate::error::OK),
        });
        req.release();
    } else if ship_path_freed {
        log::trace!("completion: write on {} fully released", req.ino());
    }
}

/// Processes one batch's downstream reply: applies completion bookkeeping
/// to every member write (and any coalesced passive entries attached to
/// it), then re-runs `process_queue`.
pub fn complete_batch(
    queue: &InodeQueue,
    batch: &WriteBatch,
    reply: DownstreamReply,
    config: &CacheConfig,
    file_state_for: &dyn Fn(Fh) -> Option<Arc<FileState>>,
) -> CompletionReport {
    let error = reply.is_error().then_some(Errno(reply.op_errno));
    let short = !reply.is_error() && (reply.op_ret as u64) < batch.total_len;

    let mut direct = Vec::new();
    {
        let mut state = queue.lock();
        for req in &batch.writes {
            complete_one(&mut state, req, error, short, &mut direct);
        }
        state.active.retain(|r| r.refcount() > 0);
        // Absorbed requests were already acknowledged to their own caller
        // with their own size at merge time (§4.2: merging requires both
        // sides already marked `write_behind`); they never get a second
        // delivery here, only pruned once their single remaining reference
        // has drained through the normal acknowledgement path.
        state.passive.retain(|p| p.absorbed.refcount() > 0);
    }

    let schedule = scheduler::process_queue(queue, config, file_state_for);
    CompletionReport { direct, schedule }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::dispatch::build_batches;
    use crate::file_state::FileOpenFlags;
    use crate::ids::{Ino, LockOwner};
    use crate::inode_queue::InodeQueue;
    use bytes::BytesMut;

    fn no_file_state(_fh: Fh) -> Option<Arc<FileState>> {
        None
    }

    fn no_flags(_fh: Fh) -> FileOpenFlags {
        FileOpenFlags::empty()
    }

    #[test]
    fn error_reply_latches_on_inode() {
        let cfg = CacheConfig::new();
        let q = InodeQueue::new(Ino(1), &cfg);
        let req = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"hi"[..]), LockOwner(0));
        req.insert_write_flag(WriteFlags::WRITE_BEHIND);
        req.insert_write_flag(WriteFlags::STACK_WOUND);
        let batches = build_batches(&[req], &cfg, &no_flags);
        let report = complete_batch(
            &q,
            &batches[0],
            DownstreamReply::err(libc::ENOSPC),
            &cfg,
            &no_file_state,
        );
        assert!(report.direct.is_empty());
        let mut state = q.lock();
        assert_eq!(state.take_latched_error(), Errno(libc::ENOSPC));
    }

    #[test]
    fn unacked_write_gets_direct_delivery_on_error() {
        let cfg = CacheConfig::new();
        let q = InodeQueue::new(Ino(1), &cfg);
        let req = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"hi"[..]), LockOwner(0));
        // Shipped without having been acknowledged: the pass-through case.
        req.insert_write_flag(WriteFlags::STACK_WOUND);
        let batches = build_batches(&[req.clone()], &cfg, &no_flags);
        let report = complete_batch(
            &q,
            &batches[0],
            DownstreamReply::err(libc::ENOSPC),
            &cfg,
            &no_file_state,
        );
        assert_eq!(report.direct.len(), 1);
        assert_eq!(report.direct[0].error, Errno(libc::ENOSPC));
        assert_eq!(req.refcount(), 0);
    }

    #[test]
    fn short_write_latches_eio() {
        let cfg = CacheConfig::new();
        let q = InodeQueue::new(Ino(1), &cfg);
        let req = q.enqueue_write(Fh(1), 0, BytesMut::from(&b"hello"[..]), LockOwner(0));
        req.insert_write_flag(WriteFlags::WRITE_BEHIND);
        req.insert_write_flag(WriteFlags::STACK_WOUND);
        let batches = build_batches(&[req], &cfg, &no_flags);
        let mut reply = DownstreamReply::ok();
        reply.op_ret = 2;
        let report = complete_batch(&q, &batches[0], reply, &cfg, &no_file_state);
        assert!(report.direct.is_empty());
        let mut state = q.lock();
        assert_eq!(state.take_latched_error(), Errno::EIO);
    }
}
