//! Registration-gated streaming file server.

mod registry;
mod scheduler;

pub use registry::FileRegistry;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tether_model::FileMetadata;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::router::{Router, SenderRef};

use scheduler::{Scheduler, Transfer};

/// Streaming file server, used to serve both small files like job sources
/// and huge files like disk images.
///
/// Paths must be explicitly registered by a trusted context before they will
/// be served to an untrusted one. Transfer requests return metadata
/// immediately; the chunks themselves are pumped by a dedicated scheduler
/// task that shares each physical stream fairly and keeps its in-flight
/// byte count below the configured bound (see [`TransferConfig`]).
pub struct FileService {
    registry: FileRegistry,
    queue: Mutex<Option<mpsc::UnboundedSender<Transfer>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl FileService {
    /// Bound on inbound request payload size, for the service dispatcher.
    pub const MAX_MESSAGE_SIZE: usize = 1000;

    /// Create the service and start its scheduler task.
    pub fn new(router: Arc<dyn Router>, config: TransferConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let handle = Scheduler::spawn(router, config, queue_rx);
        Self {
            registry: FileRegistry::new(),
            queue: Mutex::new(Some(queue_tx)),
            scheduler: Mutex::new(Some(handle)),
        }
    }

    /// Authorize a path for access by child contexts. Trusted callers only;
    /// calling this repeatedly with the same path is harmless.
    pub async fn register(&self, path: &Path) -> Result<()> {
        self.registry.register(path).await
    }

    /// Set up a transfer of `path` towards `sender`, returning the file's
    /// metadata immediately. Chunks flow asynchronously; the sender is
    /// closed after the final one so the receiving loop can compare the
    /// delivered byte count against `size`.
    pub async fn fetch(&self, path: &Path, sender: SenderRef) -> Result<FileMetadata> {
        let Some(metadata) = self.registry.lookup(path) else {
            return Err(Error::Unregistered(path.to_owned()));
        };

        let file = tokio::fs::File::open(path).await?;
        let transfer = Transfer {
            id: Uuid::now_v7(),
            path: path.to_owned(),
            sender,
            file,
        };
        debug!(path = %path.display(), transfer = %transfer.id, "serving");

        self.queue
            .lock()
            .await
            .as_ref()
            .ok_or(Error::ServiceShutDown)?
            .send(transfer)
            .map_err(|_| Error::ServiceShutDown)?;
        Ok(metadata)
    }

    /// Close the scheduler's input queue. The scheduler wakes, closes every
    /// pending sender and source file, and exits; in-flight transfers are
    /// aborted and their receivers observe a size mismatch.
    pub async fn on_shutdown(&self) {
        debug!("closing file scheduler queue");
        self.queue.lock().await.take();
    }

    /// Wait for the scheduler task to finish its shutdown drain. Meaningful
    /// only after [`on_shutdown`](Self::on_shutdown).
    pub async fn join_scheduler(&self) {
        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl fmt::Debug for FileService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("FileService");
        debug.field("registered_paths", &self.registry.registered_count());
        match self.queue.try_lock() {
            Ok(queue) => {
                debug.field("accepting_fetches", &queue.is_some());
            }
            Err(_) => {
                debug.field("queue", &"<locked>");
            }
        }
        debug.finish()
    }
}
