//! Write-behind cache core for a stackable filesystem layer.
//!
//! This crate implements the scheduling and coalescing logic of a
//! write-behind translator: it decides when a write may be acknowledged to
//! its caller ahead of the backing store's reply, how queued writes merge
//! into larger downstream calls, and when queued non-write operations must
//! wait behind pending writes. It does not implement a filesystem, a wire
//! protocol, or a transport — those are the surrounding layer's job; this
//! core only consumes a [`BackingStore`] it is handed.
//!
//! The entry point is [`Cache`]: construct one with a [`CacheConfig`] and a
//! `BackingStore` implementation, then drive it through `open`/`create` and
//! the per-op methods (`write`, `read`, `stat`, `fstat`, `truncate`,
//! `ftruncate`, `setattr`, `flush`, `fsync`). Every op resolves through a
//! caller-supplied [`ReplySink`] rather than a return value, so a caller can
//! be serviced from whichever thread the scheduler or the backing store
//! happens to run on.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(feature = "async")]
mod async_bridge;
mod coalescer;
mod completion;
mod config;
mod dispatch;
mod error;
mod file_state;
mod ids;
mod inode_queue;
mod request;
mod scheduler;
mod stats;
mod surface;

#[cfg(feature = "async")]
pub use crate::async_bridge::{AsyncBackingStore, AsyncBridge};
pub use crate::config::CacheConfig;
pub use crate::dispatch::{
    Attr, BackingStore, DownstreamCallback, DownstreamOp, DownstreamReply, ReplyPayload,
    WriteBatch,
};
pub use crate::error::Errno;
pub use crate::file_state::FileOpenFlags;
pub use crate::ids::{Fh, Ino, LockOwner};
pub use crate::request::{ReplySink, SetattrArgs};
pub use crate::stats::{CacheStats, FdSnapshot, InodeSnapshot, RequestSnapshot};
pub use crate::surface::Cache;
