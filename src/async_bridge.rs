//! Bridges an async [`BackingStore`] implementation onto the synchronous
//! `forward`/callback interface this core actually consumes, the way the
//! teacher's own `async` feature bridges a session loop onto tokio rather
//! than making the core itself `async fn`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::dispatch::{BackingStore, DownstreamCallback, DownstreamOp, DownstreamReply};

/// An async-native downstream collaborator. Implement this instead of
/// [`BackingStore`] directly when the real transport is itself async (a
/// network client, an async file handle); wrap it in an [`AsyncBridge`] to
/// hand it to [`crate::Cache`].
#[async_trait]
pub trait AsyncBackingStore: Send + Sync {
    /// Forwards one op downstream, resolving with its reply.
    async fn forward(&self, op: DownstreamOp) -> DownstreamReply;
}

/// Adapts an [`AsyncBackingStore`] to [`BackingStore`] by spawning each
/// forwarded op onto a tokio runtime and invoking the synchronous callback
/// once the async call resolves.
pub struct AsyncBridge<S> {
    inner: Arc<S>,
    handle: Handle,
}

impl<S: AsyncBackingStore + 'static> AsyncBridge<S> {
    /// Builds a bridge that spawns onto `handle`.
    #[must_use]
    pub fn new(inner: Arc<S>, handle: Handle) -> AsyncBridge<S> {
        AsyncBridge { inner, handle }
    }
}

impl<S: AsyncBackingStore + 'static> BackingStore for AsyncBridge<S> {
    fn forward(&self, op: DownstreamOp, callback: DownstreamCallback) {
        let inner = self.inner.clone();
        self.handle.spawn(async move {
            let reply = inner.forward(op).await;
            callback(reply);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ReplyPayload;

    struct EchoStore;

    #[async_trait]
    impl AsyncBackingStore for EchoStore {
        async fn forward(&self, op: DownstreamOp) -> DownstreamReply {
            match op {
                DownstreamOp::Write(batch) => DownstreamReply {
                    op_ret: batch.total_len as i64,
                    op_errno: 0,
                    payload: ReplyPayload::None,
                },
                _ => DownstreamReply::ok(),
            }
        }
    }

    #[tokio::test]
    async fn bridged_write_reaches_callback() {
        let rt = Handle::current();
        let bridge = AsyncBridge::new(Arc::new(EchoStore), rt);

        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge.forward(
            DownstreamOp::Stat,
            Box::new(move |reply| {
                let _ = tx.send(reply.op_ret);
            }),
        );
        assert_eq!(rx.await.unwrap(), 0);
    }
}
