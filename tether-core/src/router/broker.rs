use std::fmt;

use tether_model::StreamId;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{Error, Result};

/// How many disconnect events may queue per subscriber before the slowest
/// subscriber starts losing them. Purges are advisory, so a lagging consumer
/// resynchronizes on the next event.
const DISCONNECT_CHANNEL_CAPACITY: usize = 64;

type DeferredJob = Box<dyn FnOnce() + Send>;

/// Handle to the broker task.
///
/// All physical stream work happens on the broker; application tasks interact
/// with it by deferring closures ([`defer`](Self::defer)) and by subscribing
/// to stream-disconnect notifications. Transports announce a dead stream via
/// [`notify_disconnect`](Self::notify_disconnect) and the broker fans the
/// event out to every subscriber without ever blocking on them.
#[derive(Clone)]
pub struct BrokerHandle {
    defer_tx: mpsc::UnboundedSender<DeferredJob>,
    disconnect_tx: broadcast::Sender<StreamId>,
}

impl BrokerHandle {
    /// Spawn the deferred-closure executor and return its handle.
    pub fn spawn() -> Self {
        let (defer_tx, mut defer_rx) = mpsc::unbounded_channel::<DeferredJob>();
        let (disconnect_tx, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(job) = defer_rx.recv().await {
                job();
            }
        });
        Self {
            defer_tx,
            disconnect_tx,
        }
    }

    /// Run `f` on the broker and await its result.
    pub async fn defer<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.defer_tx
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| Error::ServiceShutDown)?;
        rx.await.map_err(|_| Error::ServiceShutDown)
    }

    /// Queue `f` on the broker without waiting for it to run.
    pub fn defer_detached<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.defer_tx.send(Box::new(f));
    }

    /// Subscribe to stream-disconnect notifications.
    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<StreamId> {
        self.disconnect_tx.subscribe()
    }

    /// Announce that a physical stream has gone away. Called by transports.
    pub fn notify_disconnect(&self, stream: StreamId) {
        let _ = self.disconnect_tx.send(stream);
    }
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("disconnect_subscribers", &self.disconnect_tx.receiver_count())
            .field("defer_queue_open", &!self.defer_tx.is_closed())
            .finish()
    }
}
