//! In-memory fakes for the router contract, shared by the integration
//! suites. Streams track their queued byte counts so backpressure behaviour
//! is observable, and every sender enqueue is deferred to the broker the way
//! the production transport does it.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tether_core::Error;
use tether_core::router::{
    BrokerHandle, ContextRef, RemoteContext, RemoteProc, Router, Sender, Stream,
    StreamRef,
};
use tether_model::{ContextId, StreamId};

/// Transport methods the fake router understands.
const METHODS: [&str; 3] = ["local", "ssh", "sudo"];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct FakeContext {
    id: ContextId,
    stream: StreamId,
    home_dir: String,
    shutdown_called: AtomicBool,
    calls: Mutex<Vec<RemoteProc>>,
}

impl FakeContext {
    pub fn shutdown_called(&self) -> bool {
        self.shutdown_called.load(Ordering::SeqCst)
    }

    /// Every remote procedure invoked on this context, in order.
    pub fn calls(&self) -> Vec<RemoteProc> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl RemoteContext for FakeContext {
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn stream_id(&self) -> StreamId {
        self.stream
    }

    async fn call(&self, proc: RemoteProc) -> tether_core::Result<Value> {
        self.calls.lock().expect("calls lock").push(proc);
        match proc {
            RemoteProc::ExpandUser => Ok(Value::String(self.home_dir.clone())),
            _ => Ok(Value::Null),
        }
    }

    fn call_async(&self, proc: RemoteProc) {
        self.calls.lock().expect("calls lock").push(proc);
    }

    fn shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
    }
}

pub struct FakeStream {
    id: StreamId,
    queued: AtomicUsize,
}

impl FakeStream {
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Simulate the broker writing `bytes` out of the queue.
    pub fn drain(&self, bytes: usize) {
        let mut current = self.queued.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.queued.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn enqueue(&self, bytes: usize) {
        self.queued.fetch_add(bytes, Ordering::SeqCst);
    }
}

impl Stream for FakeStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn pending_bytes(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// Ordered record of chunk and close events across senders.
#[derive(Default)]
pub struct TransferJournal {
    events: Mutex<Vec<JournalEvent>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEvent {
    Chunk { tag: String, len: usize },
    Close { tag: String },
}

impl TransferJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<JournalEvent> {
        self.events.lock().expect("journal lock").clone()
    }

    fn push(&self, event: JournalEvent) {
        self.events.lock().expect("journal lock").push(event);
    }
}

/// Per-sender byte log filled in on the broker.
#[derive(Default)]
pub struct SenderLog {
    bytes: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl SenderLog {
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.lock().expect("log lock").len()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().expect("log lock").clone()
    }
}

pub struct FakeSender {
    context: ContextId,
    tag: String,
    broker: BrokerHandle,
    stream: Arc<FakeStream>,
    log: Arc<SenderLog>,
    journal: Option<Arc<TransferJournal>>,
}

impl Sender for FakeSender {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn send(&self, chunk: Bytes) -> tether_core::Result<()> {
        // The enqueue happens on the broker, as the production sender's
        // does; the scheduler's deferred pending-bytes read is therefore
        // ordered behind it.
        let stream = self.stream.clone();
        let log = self.log.clone();
        let journal = self.journal.clone();
        let tag = self.tag.clone();
        self.broker.defer_detached(move || {
            stream.enqueue(chunk.len());
            if let Some(journal) = journal {
                journal.push(JournalEvent::Chunk {
                    tag,
                    len: chunk.len(),
                });
            }
            log.bytes.lock().expect("log lock").extend_from_slice(&chunk);
        });
        Ok(())
    }

    fn close(&self) {
        // Also through the broker, so close ordering matches chunk ordering.
        let log = self.log.clone();
        let journal = self.journal.clone();
        let tag = self.tag.clone();
        self.broker.defer_detached(move || {
            if let Some(journal) = journal {
                journal.push(JournalEvent::Close { tag });
            }
            log.closed.store(true, Ordering::SeqCst);
        });
    }
}

struct RouterState {
    next_context: u32,
    next_stream: u32,
    contexts: HashMap<ContextId, Arc<FakeContext>>,
    streams: HashMap<StreamId, Arc<FakeStream>>,
    stream_by_context: HashMap<ContextId, StreamId>,
    connects: Vec<(String, Option<ContextId>)>,
    failing: HashSet<String>,
}

pub struct FakeRouter {
    broker: BrokerHandle,
    connect_delay: Duration,
    state: Mutex<RouterState>,
}

impl FakeRouter {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// A router whose connects take `delay`, widening single-flight races.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            broker: BrokerHandle::spawn(),
            connect_delay: delay,
            state: Mutex::new(RouterState {
                next_context: 1,
                next_stream: 1,
                contexts: HashMap::new(),
                streams: HashMap::new(),
                stream_by_context: HashMap::new(),
                connects: Vec::new(),
                failing: HashSet::new(),
            }),
        })
    }

    /// How many times `method` was invoked.
    pub fn connect_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .expect("router lock")
            .connects
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Every invocation in order: `(method, via)`.
    pub fn connects(&self) -> Vec<(String, Option<ContextId>)> {
        self.state.lock().expect("router lock").connects.clone()
    }

    /// Make subsequent connects for `method` fail with a stream error.
    pub fn set_failing(&self, method: &str, failing: bool) {
        let mut state = self.state.lock().expect("router lock");
        if failing {
            state.failing.insert(method.to_string());
        } else {
            state.failing.remove(method);
        }
    }

    pub fn context(&self, id: ContextId) -> Arc<FakeContext> {
        self.state.lock().expect("router lock").contexts[&id].clone()
    }

    pub fn stream_of(&self, context: ContextId) -> Arc<FakeStream> {
        let state = self.state.lock().expect("router lock");
        let stream_id = state.stream_by_context[&context];
        state.streams[&stream_id].clone()
    }

    /// Simulate the broker noticing a dead stream.
    pub fn disconnect(&self, stream: StreamId) {
        self.broker.notify_disconnect(stream);
    }

    /// Context on a dedicated stream without going through `connect`; used
    /// as the destination endpoint for file transfers.
    pub fn add_destination(&self, home_dir: &str) -> Arc<FakeContext> {
        let mut state = self.state.lock().expect("router lock");
        let stream_id = StreamId(state.next_stream);
        state.next_stream += 1;
        let stream = Arc::new(FakeStream {
            id: stream_id,
            queued: AtomicUsize::new(0),
        });
        state.streams.insert(stream_id, stream);

        let id = ContextId(state.next_context);
        state.next_context += 1;
        let context = Arc::new(FakeContext {
            id,
            stream: stream_id,
            home_dir: home_dir.to_string(),
            shutdown_called: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        state.contexts.insert(id, context.clone());
        state.stream_by_context.insert(id, stream_id);
        context
    }

    /// A sender delivering into `context`'s stream, with an optional shared
    /// journal for cross-transfer ordering assertions.
    pub fn sender_for(
        &self,
        context: &Arc<FakeContext>,
        journal: Option<Arc<TransferJournal>>,
        tag: &str,
    ) -> (Arc<FakeSender>, Arc<SenderLog>) {
        let stream = self.stream_of(context.context_id());
        let log = Arc::new(SenderLog::default());
        let sender = Arc::new(FakeSender {
            context: context.context_id(),
            tag: tag.to_string(),
            broker: self.broker.clone(),
            stream,
            log: log.clone(),
            journal,
        });
        (sender, log)
    }

    /// A sender whose destination context the router cannot route to.
    pub fn orphan_sender(&self) -> (Arc<FakeSender>, Arc<SenderLog>) {
        let log = Arc::new(SenderLog::default());
        let stream = Arc::new(FakeStream {
            id: StreamId(u32::MAX),
            queued: AtomicUsize::new(0),
        });
        let sender = Arc::new(FakeSender {
            context: ContextId(u32::MAX),
            tag: "orphan".to_string(),
            broker: self.broker.clone(),
            stream,
            log: log.clone(),
            journal: None,
        });
        (sender, log)
    }
}

#[async_trait]
impl Router for FakeRouter {
    async fn connect(
        &self,
        method: &str,
        _kwargs: &Map<String, Value>,
        via: Option<&ContextRef>,
    ) -> tether_core::Result<ContextRef> {
        if !METHODS.contains(&method) {
            return Err(Error::UnsupportedMethod(method.to_string()));
        }

        let failing = {
            let mut state = self.state.lock().expect("router lock");
            state
                .connects
                .push((method.to_string(), via.map(|v| v.context_id())));
            state.failing.contains(method)
        };

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if failing {
            return Err(Error::Stream(format!("{method}: connection refused")));
        }

        let mut state = self.state.lock().expect("router lock");
        let stream_id = match via {
            // Chained hops are reached over their parent's physical stream.
            Some(parent) => parent.stream_id(),
            None => {
                let id = StreamId(state.next_stream);
                state.next_stream += 1;
                state.streams.insert(
                    id,
                    Arc::new(FakeStream {
                        id,
                        queued: AtomicUsize::new(0),
                    }),
                );
                id
            }
        };

        let id = ContextId(state.next_context);
        state.next_context += 1;
        let context = Arc::new(FakeContext {
            id,
            stream: stream_id,
            home_dir: format!("/home/{method}{}", id.0),
            shutdown_called: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        state.contexts.insert(id, context.clone());
        state.stream_by_context.insert(id, stream_id);
        Ok(context as ContextRef)
    }

    fn stream_by_id(&self, context_id: ContextId) -> Option<StreamRef> {
        let state = self.state.lock().expect("router lock");
        let stream_id = state.stream_by_context.get(&context_id)?;
        state
            .streams
            .get(stream_id)
            .map(|stream| stream.clone() as StreamRef)
    }

    fn broker(&self) -> &BrokerHandle {
        &self.broker
    }
}

/// Background task draining a stream at a fixed rate, standing in for the
/// broker's write loop.
pub fn spawn_drainer(
    stream: Arc<FakeStream>,
    bytes_per_tick: usize,
    tick: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tick).await;
            stream.drain(bytes_per_tick);
        }
    })
}

/// Background task recording the highest queued byte count it observes.
pub fn spawn_sampler(stream: Arc<FakeStream>) -> Arc<AtomicUsize> {
    let max = Arc::new(AtomicUsize::new(0));
    let observed = max.clone();
    tokio::spawn(async move {
        loop {
            observed.fetch_max(stream.queued_bytes(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    max
}
