use std::collections::HashMap;
use std::fmt;

use tether_model::{ContextId, Fingerprint, StreamId};
use tokio::sync::oneshot;

use crate::error::Error;
use crate::router::ContextRef;

/// Successful establishment result, shared with every waiter and returned
/// verbatim for identical subsequent requests.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    pub context: ContextRef,
    pub home_dir: String,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("context", &self.context.context_id())
            .field("home_dir", &self.home_dir)
            .finish()
    }
}

/// Failure delivered to every waiter of an establishment. Cloneable so one
/// failure can fan out to the whole waiter list.
#[derive(Clone, Debug)]
pub(crate) struct ConnectFailure {
    pub method: String,
    pub message: String,
    pub kind: FailureKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailureKind {
    /// Transport failure: reported softly with the failing hop named.
    Stream,
    /// The router knows no such method.
    UnsupportedMethod,
    /// Remote-side fault during establishment.
    Remote,
}

impl ConnectFailure {
    pub fn classify(method: &str, error: &Error) -> Self {
        let kind = match error {
            Error::UnsupportedMethod(_) => FailureKind::UnsupportedMethod,
            Error::Stream(_) | Error::Io(_) => FailureKind::Stream,
            _ => FailureKind::Remote,
        };
        Self {
            method: method.to_string(),
            message: error.to_string(),
            kind,
        }
    }

    pub fn stream_lost(method: &str) -> Self {
        Self {
            method: method.to_string(),
            message: format!("stream disconnected while establishing {method}"),
            kind: FailureKind::Stream,
        }
    }

    pub fn into_error(self) -> Error {
        match self.kind {
            FailureKind::UnsupportedMethod => Error::UnsupportedMethod(self.method),
            FailureKind::Stream => Error::Stream(self.message),
            FailureKind::Remote => Error::Call(self.message),
        }
    }
}

pub(crate) type EstablishOutcome = Result<CacheEntry, ConnectFailure>;

/// Result of inserting a freshly established child into its parent's list.
pub(crate) enum LruInsert {
    Appended,
    /// The newest idle entry was recycled; shut it down outside the lock.
    Evicted(ContextRef),
    /// Every entry is in use; the list grew past its bound instead of
    /// failing the request.
    OverSubscribed,
}

pub(crate) enum PutOutcome {
    Underflow,
    Remaining(usize),
}

/// Everything the context service mutex protects.
///
/// Pure bookkeeping: no I/O, no remote calls, nothing that can suspend. The
/// service performs establishment outside the lock and publishes the result
/// through one of the methods below.
#[derive(Default)]
pub(crate) struct CacheState {
    /// Establishment results by fingerprint.
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Latches awaiting the first establishment for a fingerprint.
    waiters: HashMap<Fingerprint, Vec<oneshot::Sender<EstablishOutcome>>>,
    /// Live borrow counts; `get` increments, `put` decrements.
    refs: HashMap<ContextId, usize>,
    /// Child contexts per via parent, in creation order.
    lru_by_via: HashMap<ContextId, Vec<ContextRef>>,
    /// Fingerprint that established each cached context.
    key_by_context: HashMap<ContextId, Fingerprint>,
}

impl CacheState {
    /// Cache hit: bump the refcount and hand out the entry.
    pub fn hit(&mut self, key: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        *self.refs.entry(entry.context.context_id()).or_insert(0) += 1;
        Some(entry.clone())
    }

    /// Enroll a waiter for `key`. Returns `true` when it is the first and
    /// the caller must perform the establishment.
    pub fn enroll(
        &mut self,
        key: Fingerprint,
        waiter: oneshot::Sender<EstablishOutcome>,
    ) -> bool {
        let waiters = self.waiters.entry(key).or_default();
        waiters.push(waiter);
        waiters.len() == 1
    }

    /// Publish a successful establishment: record the entry, set the
    /// refcount to the number of waiters (each becomes a holder), and
    /// deliver to all of them. One critical section, so a late requester
    /// either enrolled in time and is counted, or arrives afterwards and
    /// takes the cache-hit branch; no window exists in between.
    pub fn publish_success(&mut self, key: &Fingerprint, entry: CacheEntry) -> usize {
        let id = entry.context.context_id();
        let waiters = self.waiters.remove(key).unwrap_or_default();
        self.entries.insert(key.clone(), entry.clone());
        self.key_by_context.insert(id, key.clone());
        self.refs.insert(id, waiters.len());
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Ok(entry.clone()));
        }
        count
    }

    /// Deliver a failure to every waiter. Nothing is recorded; the next
    /// request for the key retries from scratch.
    pub fn publish_failure(&mut self, key: &Fingerprint, failure: ConnectFailure) {
        for waiter in self.waiters.remove(key).unwrap_or_default() {
            let _ = waiter.send(Err(failure.clone()));
        }
    }

    /// Return a borrow.
    pub fn put(&mut self, id: ContextId) -> PutOutcome {
        match self.refs.get_mut(&id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                PutOutcome::Remaining(*count)
            }
            _ => PutOutcome::Underflow,
        }
    }

    /// Append a freshly established child to its parent's list, recycling
    /// the newest idle entry when the list is full.
    pub fn lru_insert(
        &mut self,
        via: ContextId,
        context: ContextRef,
        max_interpreters: usize,
    ) -> LruInsert {
        let victim = {
            let refs = &self.refs;
            let lru = self.lru_by_via.entry(via).or_default();
            if lru.len() < max_interpreters {
                lru.push(context);
                return LruInsert::Appended;
            }
            // Scan newest-first: older entries are assumed more load-bearing
            // in a chain and survive when possible. A context that sits in
            // the list but has not been published yet has no refcount and
            // counts as busy.
            let victim_index = lru.iter().rposition(|candidate| {
                refs.get(&candidate.context_id()).copied().unwrap_or(1) == 0
            });
            match victim_index {
                Some(index) => {
                    let victim = lru.remove(index);
                    lru.push(context);
                    victim
                }
                None => {
                    lru.push(context);
                    return LruInsert::OverSubscribed;
                }
            }
        };
        let victim_id = victim.context_id();
        if let Some(key) = self.key_by_context.remove(&victim_id) {
            self.entries.remove(&key);
        }
        self.refs.remove(&victim_id);
        LruInsert::Evicted(victim)
    }

    /// Drop every record of contexts owned by a disconnected stream,
    /// returning their ids. Waiters for the dropped fingerprints observe a
    /// closed latch and surface a stream error.
    pub fn purge_stream(&mut self, stream: StreamId) -> Vec<ContextId> {
        let affected: Vec<(Fingerprint, ContextId)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.context.stream_id() == stream)
            .map(|(key, entry)| (key.clone(), entry.context.context_id()))
            .collect();

        let mut purged = Vec::with_capacity(affected.len());
        for (key, id) in affected {
            self.entries.remove(&key);
            self.waiters.remove(&key);
            self.refs.remove(&id);
            self.key_by_context.remove(&id);
            self.lru_by_via.remove(&id);
            purged.push(id);
        }
        if !purged.is_empty() {
            for lru in self.lru_by_via.values_mut() {
                lru.retain(|context| context.stream_id() != stream);
            }
            self.lru_by_via.retain(|_, lru| !lru.is_empty());
        }
        purged
    }

    /// Remove and return every cached context, resetting the LRU tables.
    /// In-flight establishments keep their waiters and publish normally.
    pub fn drain_all(&mut self) -> Vec<ContextRef> {
        let contexts: Vec<ContextRef> =
            self.entries.drain().map(|(_, entry)| entry.context).collect();
        self.refs.clear();
        self.key_by_context.clear();
        self.lru_by_via.clear();
        contexts
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn refcount(&self, id: ContextId) -> Option<usize> {
        self.refs.get(&id).copied()
    }

    #[cfg(test)]
    fn lru_len(&self, via: ContextId) -> usize {
        self.lru_by_via.get(&via).map(Vec::len).unwrap_or(0)
    }
}
