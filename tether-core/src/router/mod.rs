//! Contracts consumed from the chained transport router.
//!
//! The router itself lives outside this crate: it brings up child
//! interpreters by method name, owns the broker that performs all physical
//! stream I/O, and hands back opaque context handles. The services here only
//! depend on the traits below, so tests drive them with in-memory fakes.

mod broker;

pub use broker::BrokerHandle;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tether_model::{ContextId, StreamId};

use crate::error::Result;

/// Remote procedures the service core invokes on a freshly established
/// context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteProc {
    /// Resolve the remote account's home directory.
    ExpandUser,
    /// Prime the remote task-parent helper so later job dispatch does not pay
    /// the fork cost.
    StartTaskParent,
    /// Ask the remote interpreter to dump its thread stacks to its logger.
    DumpThreadStacks,
}

/// Live remote interpreter handle yielded by the router.
#[async_trait]
pub trait RemoteContext: Send + Sync {
    /// Stable identity of this context.
    fn context_id(&self) -> ContextId;

    /// The physical stream this context is reached through. Chained contexts
    /// share their parent's stream.
    fn stream_id(&self) -> StreamId;

    /// Round-trip call, suspending the calling task until the remote replies.
    async fn call(&self, proc: RemoteProc) -> Result<Value>;

    /// Fire-and-forget call. Failures surface only in the remote's logs.
    fn call_async(&self, proc: RemoteProc);

    /// Ask the remote interpreter to exit. Non-blocking; the disconnect of
    /// its stream is observed later through the broker.
    fn shutdown(&self);
}

/// Shared ownership of a remote context handle.
pub type ContextRef = Arc<dyn RemoteContext>;

/// A physical byte channel drained by the broker.
pub trait Stream: Send + Sync {
    /// Identity of this stream.
    fn id(&self) -> StreamId;

    /// Bytes enqueued for this stream but not yet written out. Only
    /// meaningful when read on the broker via [`BrokerHandle::defer`];
    /// reading it anywhere else races the broker's own deferred enqueues.
    fn pending_bytes(&self) -> usize;
}

/// Shared ownership of a stream handle.
pub type StreamRef = Arc<dyn Stream>;

/// One-way chunk endpoint owned by a fetch caller. The file service is only
/// authorized to `send` and `close` it.
pub trait Sender: Send + Sync {
    /// Context the paired receiver lives on.
    fn context_id(&self) -> ContextId;

    /// Enqueue one chunk for delivery.
    fn send(&self, chunk: Bytes) -> Result<()>;

    /// Signal end-of-stream, terminating the paired receive loop.
    fn close(&self);
}

/// Shared ownership of a sender endpoint.
pub type SenderRef = Arc<dyn Sender>;

/// Chained transport router.
#[async_trait]
pub trait Router: Send + Sync {
    /// Establish a new context. `via` chains the hop through an existing
    /// context; `None` connects directly from the multiplexer. An unknown
    /// `method` fails with [`crate::Error::UnsupportedMethod`]; transport
    /// failures with [`crate::Error::Stream`].
    async fn connect(
        &self,
        method: &str,
        kwargs: &Map<String, Value>,
        via: Option<&ContextRef>,
    ) -> Result<ContextRef>;

    /// The stream a context is reached through, if it is still routable.
    fn stream_by_id(&self, context_id: ContextId) -> Option<StreamRef>;

    /// Handle to the broker owning all physical stream I/O.
    fn broker(&self) -> &BrokerHandle;
}
