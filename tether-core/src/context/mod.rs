//! Deduplicating, reference-counted cache of live remote connections.

mod cache;

use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tether_model::{ConnectionSpec, ContextId, Fingerprint, StreamId};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::router::{ContextRef, RemoteProc, Router};

use cache::{
    CacheEntry, CacheState, ConnectFailure, EstablishOutcome, FailureKind, LruInsert,
    PutOutcome,
};

/// Response for [`ContextService::get`].
///
/// On success `context` and `home_dir` are set and `msg` is `None`. On
/// transport failure they are `None`, `msg` carries the error text, and
/// `method_name` names the failing hop.
#[derive(Clone)]
pub struct ContextResponse {
    /// Established context for the final hop of the stack.
    pub context: Option<ContextRef>,
    /// The remote account's home directory.
    pub home_dir: Option<String>,
    /// Transport error text, when establishment failed softly.
    pub msg: Option<String>,
    /// The failing hop's method name, when establishment failed softly.
    pub method_name: Option<String>,
}

impl ContextResponse {
    fn established(entry: &CacheEntry) -> Self {
        Self {
            context: Some(entry.context.clone()),
            home_dir: Some(entry.home_dir.clone()),
            msg: None,
            method_name: None,
        }
    }

    fn failed(failure: &ConnectFailure) -> Self {
        Self {
            context: None,
            home_dir: None,
            msg: Some(failure.message.clone()),
            method_name: Some(failure.method.clone()),
        }
    }

    /// True when the response carries a usable context.
    pub fn is_established(&self) -> bool {
        self.context.is_some()
    }
}

impl fmt::Debug for ContextResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextResponse")
            .field("context", &self.context.as_ref().map(|c| c.context_id()))
            .field("home_dir", &self.home_dir)
            .field("msg", &self.msg)
            .field("method_name", &self.method_name)
            .finish()
    }
}

/// Used by workers to fetch the single context instance corresponding to a
/// connection configuration, creating the matching connection when it does
/// not exist.
///
/// This concentrates connections in the multiplexer process, which may become
/// a bottleneck. The bottleneck can be removed later by sharding workers over
/// per-CPU multiplexers according to a hash of the connection parameters.
pub struct ContextService {
    router: Arc<dyn Router>,
    config: ContextConfig,
    state: Mutex<CacheState>,
}

impl ContextService {
    /// Bound on inbound request payload size, for the service dispatcher.
    pub const MAX_MESSAGE_SIZE: usize = 1000;

    /// Create the service and start consuming the broker's disconnect feed.
    pub fn new(router: Arc<dyn Router>, config: ContextConfig) -> Arc<Self> {
        let service = Arc::new(Self {
            router: router.clone(),
            config,
            state: Mutex::new(CacheState::default()),
        });
        let disconnects = router.broker().subscribe_disconnects();
        tokio::spawn(Self::watch_disconnects(Arc::downgrade(&service), disconnects));
        service
    }

    /// Return a context referring to an established connection with the
    /// given configuration, establishing new connections as necessary.
    ///
    /// Each element of `stack` is proxied via the context produced by the
    /// previous one. Transport failures come back as a populated error
    /// response; anything else (an unknown method, a remote fault) is an
    /// `Err`. A caller that receives a context must eventually
    /// [`put`](Self::put) it; a caller that receives an error must not.
    pub async fn get(&self, stack: &[ConnectionSpec]) -> Result<ContextResponse> {
        let mut via: Option<ContextRef> = None;
        let mut last: Option<CacheEntry> = None;
        for spec in stack {
            let rx = self.wait_or_start(spec, via.as_ref()).await;
            let outcome = match rx.await {
                Ok(outcome) => outcome,
                // The enrollment was dropped by a disconnect purge before
                // the result could be delivered.
                Err(_) => Err(ConnectFailure::stream_lost(&spec.method)),
            };
            match outcome {
                Ok(entry) => {
                    via = Some(entry.context.clone());
                    last = Some(entry);
                }
                Err(failure) if failure.kind == FailureKind::Stream => {
                    // Earlier hops keep the references taken for them.
                    return Ok(ContextResponse::failed(&failure));
                }
                Err(failure) => return Err(failure.into_error()),
            }
        }
        let entry = last.ok_or(Error::EmptyStack)?;
        Ok(ContextResponse::established(&entry))
    }

    /// Return a borrowed context, making it eligible for recycling once its
    /// reference count reaches zero.
    pub async fn put(&self, context: &ContextRef) {
        let id = context.context_id();
        debug!(context = %id, "put");
        let outcome = self.state.lock().await.put(id);
        if matches!(outcome, PutOutcome::Underflow) {
            warn!(context = %id, "put: refcount was zero; shutdown_all called?");
        }
    }

    /// Arrange for every cached connection to be shut down, in arbitrary
    /// order. For testing use; concurrent getters may observe failures.
    pub async fn shutdown_all(&self) {
        let contexts = self.state.lock().await.drain_all();
        for context in contexts {
            info!(context = %context.context_id(), "shutting down");
            context.shutdown();
        }
    }

    async fn watch_disconnects(
        service: Weak<Self>,
        mut events: broadcast::Receiver<StreamId>,
    ) {
        loop {
            match events.recv().await {
                Ok(stream) => {
                    let Some(service) = service.upgrade() else { break };
                    service.on_stream_disconnect(stream).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Purges are advisory; anything missed surfaces as an
                    // establishment failure on the next request.
                    warn!(missed, "disconnect feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Respond to a stream disconnect by deleting any record of contexts
    /// reached through it. Subsequent requests re-establish.
    async fn on_stream_disconnect(&self, stream: StreamId) {
        let purged = self.state.lock().await.purge_stream(stream);
        for context in purged {
            info!(context = %context, %stream, "dropping context after stream disconnect");
        }
    }

    /// Under the lock: hand out a cached entry, or enroll as a waiter. The
    /// first waiter performs the establishment outside the lock.
    async fn wait_or_start(
        &self,
        spec: &ConnectionSpec,
        via: Option<&ContextRef>,
    ) -> oneshot::Receiver<EstablishOutcome> {
        let key = Fingerprint::of(via.map(|context| context.context_id()), spec);
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.hit(&key) {
                debug!(context = %entry.context.context_id(), method = %spec.method, "cache hit");
                let _ = tx.send(Ok(entry));
                return rx;
            }
            state.enroll(key.clone(), tx)
        };
        if first {
            self.establish(&key, spec, via).await;
        }
        rx
    }

    async fn establish(
        &self,
        key: &Fingerprint,
        spec: &ConnectionSpec,
        via: Option<&ContextRef>,
    ) {
        match self.connect(spec, via).await {
            Ok(entry) => {
                let context_id = entry.context.context_id();
                let waiters = self.state.lock().await.publish_success(key, entry);
                debug!(context = %context_id, waiters, method = %spec.method, "connection established");
            }
            Err(failure) => {
                warn!(method = %failure.method, error = %failure.message, "establishment failed");
                self.state.lock().await.publish_failure(key, failure);
            }
        }
    }

    /// Actual connect implementation: create the connection, register it for
    /// recycling or invalidation, fetch the remote home directory, and prime
    /// the remote task parent. Runs entirely outside the service lock.
    async fn connect(
        &self,
        spec: &ConnectionSpec,
        via: Option<&ContextRef>,
    ) -> std::result::Result<CacheEntry, ConnectFailure> {
        let method = spec.method.as_str();
        let context = self
            .router
            .connect(method, &spec.kwargs, via)
            .await
            .map_err(|error| ConnectFailure::classify(method, &error))?;

        if let Some(parent) = via {
            self.update_lru(parent.context_id(), context.clone()).await;
        }
        // Directly connected contexts need no list: their death arrives on
        // the broker's disconnect feed consumed by `watch_disconnects`.

        let home_dir = match context.call(RemoteProc::ExpandUser).await {
            Ok(Value::String(home)) => home,
            Ok(other) => {
                return Err(ConnectFailure {
                    method: method.to_string(),
                    message: format!("home directory lookup returned {other}"),
                    kind: FailureKind::Remote,
                });
            }
            Err(error) => return Err(ConnectFailure::classify(method, &error)),
        };

        // No need to wait for the result; the remote's logs catch a failure.
        context.call_async(RemoteProc::StartTaskParent);

        if self.config.dump_thread_stacks {
            if let Err(error) = context.call(RemoteProc::DumpThreadStacks).await {
                warn!(context = %context.context_id(), %error, "thread stack dump failed");
            }
        }

        Ok(CacheEntry { context, home_dir })
    }

    /// Record a child under its parent, shutting down the recycled entry
    /// outside the lock when the list was full.
    async fn update_lru(&self, via: ContextId, context: ContextRef) {
        let outcome = self.state.lock().await.lru_insert(
            via,
            context,
            self.config.max_interpreters,
        );
        match outcome {
            LruInsert::Appended => {}
            LruInsert::Evicted(victim) => {
                info!(victim = %victim.context_id(), parent = %via, "recycling idle interpreter to make room");
                victim.shutdown();
            }
            LruInsert::OverSubscribed => {
                warn!(parent = %via, "reached maximum number of interpreters, but all are marked in-use");
            }
        }
    }
}

impl fmt::Debug for ContextService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ContextService");
        debug.field("config", &self.config);
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("cached_contexts", &state.cached_len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}
