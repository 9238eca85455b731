//! The decision engine: `process_queue` and its three phases.

use std::sync::Arc;

use crate::coalescer::{self, PassiveEntry};
use crate::config::{CacheConfig, MAX_VECTOR_COUNT};
use crate::file_state::FileState;
use crate::ids::Fh;
use crate::inode_queue::{InodeQueue, InodeQueueState};
use crate::request::{OpKind, Request, WriteFlags};

/// The three disjoint action sets `process_queue` produces, plus any newly
/// absorbed passive entries, all computed under `InodeQueue.lock` and
/// returned for the caller to act on after the lock is released.
#[derive(Default)]
pub struct ScheduleResult {
    /// Requests to acknowledge back to their caller.
    pub to_ack: Vec<Request>,
    /// Writes to hand to the sync dispatcher.
    pub to_ship: Vec<Request>,
    /// Non-write requests whose deferred op may now run.
    pub to_resume: Vec<Request>,
    /// Writes newly absorbed into a coalesced holder this pass.
    pub passive: Vec<PassiveEntry>,
}

fn write_end(offset: i64, size: u64) -> i64 {
    offset + size as i64
}

/// §4.2: two writes overlap when `end1 >= start2 && end2 >= start1`.
fn overlaps(a_offset: i64, a_size: u64, b_offset: i64, b_size: u64) -> bool {
    write_end(a_offset, a_size) >= b_offset && write_end(b_offset, b_size) >= a_offset
}

fn write_offset_size(req: &Request) -> Option<(i64, u64)> {
    req.with_kind(|k| match k {
        OpKind::Write { offset, buf, .. } => Some((*offset, buf.len() as u64)),
        _ => None,
    })
}

/// Phase A — `__wb_mark_unwinds`. Acknowledges as many not-yet-acknowledged
/// writes, from the head, as the configured window allows.
fn mark_unwinds(state: &mut InodeQueueState) -> Vec<Request> {
    let mut to_ack = Vec::new();
    if state.window_current > state.window_conf {
        return to_ack;
    }
    let mut remaining = state.window_conf - state.window_current;
    for req in &state.active {
        if !req.is_write() {
            continue;
        }
        if req.write_flags().contains(WriteFlags::WRITE_BEHIND) {
            continue;
        }
        let size = req.size();
        if size > remaining {
            break;
        }
        req.insert_write_flag(WriteFlags::WRITE_BEHIND);
        remaining -= size;
        state.window_current += size;
        to_ack.push(req.clone());
    }
    to_ack
}

/// True if any two not-yet-shipped writes in `active` have overlapping
/// ranges, checked against every earlier request per §4.2.
fn any_overlap(state: &InodeQueueState) -> bool {
    let writes: Vec<(i64, u64)> = state
        .active
        .iter()
        .filter(|r| r.is_write() && !r.write_flags().contains(WriteFlags::STACK_WOUND))
        .filter_map(write_offset_size)
        .collect();
    for i in 0..writes.len() {
        for j in 0..i {
            if overlaps(writes[i].0, writes[i].1, writes[j].0, writes[j].1) {
                return true;
            }
        }
    }
    false
}

/// Phase C — `__wb_mark_winds`. Non-writes at the head act as barriers;
/// otherwise selects a contiguous, non-overlapping, append-ordering-safe
/// run of unshipped writes to ship.
fn mark_winds(
    state: &mut InodeQueueState,
    config: &CacheConfig,
    file_state_for: &dyn Fn(Fh) -> Option<Arc<FileState>>,
) -> (Vec<Request>, Vec<Request>) {
    let mut to_resume = Vec::new();
    let to_ship = Vec::new();

    let Some(front) = state.active.front().cloned() else {
        return (to_resume, to_ship);
    };

    if !front.is_write() {
        // Non-writes at the head are barriers: skip Phase C entirely this
        // round regardless of whether they're newly discovered or already
        // resuming from a prior pass.
        for req in &state.active {
            if req.is_write() {
                break;
            }
            if !req.non_write_flags().contains(crate::request::NonWriteFlags::MARKED_FOR_RESUME) {
                req.mark_for_resume();
                to_resume.push(req.clone());
            }
        }
        return (to_resume, to_ship);
    }

    // In-flight serialization: a shipped write awaiting its reply blocks
    // this round entirely.
    for req in &state.active {
        if !req.is_write() {
            break;
        }
        let flags = req.write_flags();
        if flags.contains(WriteFlags::STACK_WOUND) && !flags.contains(WriteFlags::GOT_REPLY) {
            return (to_resume, to_ship);
        }
    }

    let wind_all = front.write_flags().contains(WriteFlags::FLUSH_ALL);
    let overlapping_writes = any_overlap(state);
    let non_write_present = state.active.iter().any(|r| !r.is_write());

    let should_ship = config.trickling_writes()
        || wind_all
        || overlapping_writes
        || non_write_present
        || state.aggregate_current >= config.aggregate_size();

    if !should_ship {
        return (to_resume, to_ship);
    }

    ship_contiguous_run(state, config, file_state_for, to_resume, to_ship)
}

fn ship_contiguous_run(
    state: &mut InodeQueueState,
    config: &CacheConfig,
    file_state_for: &dyn Fn(Fh) -> Option<Arc<FileState>>,
    to_resume: Vec<Request>,
    mut to_ship: Vec<Request>,
) -> (Vec<Request>, Vec<Request>) {
    let mut batch_bytes: u64 = 0;
    let mut vector_count: usize = 0;
    let mut seen_append_fh: Option<Fh> = None;
    let mut touched_append_fhs: Vec<Fh> = Vec::new();

    let mut earlier: Vec<(i64, u64)> = Vec::new();

    for req in state.active.iter() {
        if !req.is_write() {
            break;
        }
        if req.write_flags().contains(WriteFlags::STACK_WOUND) {
            // Already shipped (with its reply landed, per the gate above)
            // but not yet unlinked; not a candidate, keep scanning.
            if let Some(pos) = write_offset_size(req) {
                earlier.push(pos);
            }
            continue;
        }

        let Some((offset, size)) = write_offset_size(req) else {
            break;
        };

        if earlier
            .iter()
            .any(|&(eo, es)| overlaps(offset, size, eo, es))
        {
            break;
        }

        let fh = req.fh();
        let fs = fh.and_then(|fh| file_state_for(fh));
        let is_append = fs.as_ref().map(|fs| fs.is_append()).unwrap_or(false);

        if is_append {
            let fh = fh.expect("append write always carries an fh");
            let blocked = fs.as_ref().map(|fs| fs.dont_wind()).unwrap_or(false);
            let would_overflow = batch_bytes + size > config.aggregate_size()
                || vector_count + 1 > MAX_VECTOR_COUNT;
            if blocked || would_overflow {
                // Leave this one for a later round — it still occupies its
                // byte range for the overlap check above, but a different
                // fd's write may still ship alongside it this round: only
                // writes from the *same* append fd serialize (§5).
                earlier.push((offset, size));
                continue;
            }
            match seen_append_fh {
                None => seen_append_fh = Some(fh),
                Some(first) if first != fh => {
                    // Two interleaved append-mode fds: the earlier one's
                    // future writes are blocked this round so only its
                    // first contiguous run ships, but this fd (and
                    // whatever follows it) can still ship alongside it.
                    if let Some(fs) = file_state_for(first) {
                        fs.set_dont_wind(true);
                    }
                    seen_append_fh = Some(fh);
                }
                Some(_) => {}
            }
            if !touched_append_fhs.contains(&fh) {
                touched_append_fhs.push(fh);
            }
        }

        req.insert_write_flag(WriteFlags::STACK_WOUND);
        state.aggregate_current = state.aggregate_current.saturating_sub(size);
        batch_bytes += size;
        vector_count += 1;
        to_ship.push(req.clone());
        earlier.push((offset, size));
    }

    for fh in touched_append_fhs {
        if let Some(fs) = file_state_for(fh) {
            fs.set_dont_wind(false);
        }
    }

    (to_resume, to_ship)
}

/// Runs all three phases under `InodeQueue.lock`, returning the three
/// action sets for the caller to act on once the lock is dropped.
pub fn process_queue(
    queue: &InodeQueue,
    config: &CacheConfig,
    file_state_for: &dyn Fn(Fh) -> Option<Arc<FileState>>,
) -> ScheduleResult {
    let mut state = queue.lock();

    let to_ack = mark_unwinds(&mut state);
    let passive = coalescer::collapse_write_bufs(&mut state);
    let (to_resume, to_ship) = mark_winds(&mut state, config, file_state_for);

    log::trace!(
        "process_queue: {} acked, {} absorbed, {} shipped, {} resumed",
        to_ack.len(),
        passive.len(),
        to_ship.len(),
        to_resume.len()
    );

    ScheduleResult {
        to_ack,
        to_ship,
        to_resume,
        passive,
    }
}
