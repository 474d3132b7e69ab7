use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use tether_model::StreamId;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::router::{Router, SenderRef, StreamRef};

/// One queued transfer: the caller's sender endpoint and the open source
/// file. The id exists only for log correlation.
pub(crate) struct Transfer {
    pub id: Uuid,
    pub path: PathBuf,
    pub sender: SenderRef,
    pub file: File,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("context", &self.sender.context_id())
            .finish()
    }
}

/// Per-stream transfer state. A stream has an entry exactly while its FIFO
/// is non-empty.
struct StreamQueue {
    stream: StreamRef,
    fifo: VecDeque<Transfer>,
}

/// Dedicated pump dividing transfer requests among the physical streams that
/// reach their destinations, while bounding how much data any stream keeps
/// buffered in RAM.
///
/// Transfers proceed one at a time per stream. When several contexts are
/// reachable over the same stream (an SSH account, a sudo account on the
/// same host, a proxied connection), each request is satisfied in full
/// before chunks for the next start flowing, so a contended connection
/// finishes individual transfers instead of wasting bandwidth on many
/// aborted partials.
pub(crate) struct Scheduler {
    router: Arc<dyn Router>,
    config: TransferConfig,
    queue: mpsc::UnboundedReceiver<Transfer>,
    pending_by_stream: HashMap<StreamId, StreamQueue>,
}

impl Scheduler {
    pub fn spawn(
        router: Arc<dyn Router>,
        config: TransferConfig,
        queue: mpsc::UnboundedReceiver<Transfer>,
    ) -> JoinHandle<()> {
        let scheduler = Self {
            router,
            config,
            queue,
            pending_by_stream: HashMap::new(),
        };
        tokio::spawn(scheduler.run())
    }

    async fn run(mut self) {
        while self.sleep_on_queue().await {
            let streams: Vec<StreamId> = self.pending_by_stream.keys().copied().collect();
            for stream in streams {
                self.pump_stream(stream).await;
            }
        }

        // The input queue was closed. Close every pending sender so the
        // remote receive loops terminate; each receiver then observes a size
        // mismatch and discards its partial file. Dropping the transfers
        // closes the source files.
        debug!("file scheduler draining at shutdown");
        for (_, queue) in self.pending_by_stream.drain() {
            for transfer in queue.fifo {
                transfer.sender.close();
            }
        }
    }

    /// Wait for the next transfer request: indefinitely while idle, one tick
    /// while any stream still has chunks to pump. Returns `false` once the
    /// input queue has been closed.
    async fn sleep_on_queue(&mut self) -> bool {
        let request = if self.pending_by_stream.is_empty() {
            self.queue.recv().await
        } else {
            match time::timeout(self.config.tick(), self.queue.recv()).await {
                Ok(request) => request,
                // Tick elapsed; go refill whatever the broker drained.
                Err(_) => return true,
            }
        };
        match request {
            Some(transfer) => {
                self.admit(transfer);
                true
            }
            None => false,
        }
    }

    /// Attach a new transfer to the FIFO of the stream its destination
    /// context is reached through.
    fn admit(&mut self, transfer: Transfer) {
        let context_id = transfer.sender.context_id();
        let Some(stream) = self.router.stream_by_id(context_id) else {
            // The destination vanished between fetch and pickup; dropping
            // the transfer closes the file.
            warn!(transfer = %transfer.id, context = %context_id, "no stream routes to transfer destination");
            transfer.sender.close();
            return;
        };
        debug!(
            transfer = %transfer.id,
            path = %transfer.path.display(),
            stream = %stream.id(),
            "transfer admitted"
        );
        self.pending_by_stream
            .entry(stream.id())
            .or_insert_with(|| StreamQueue {
                stream,
                fifo: VecDeque::new(),
            })
            .fifo
            .push_back(transfer);
    }

    /// Measure a stream's output backlog, synchronized with the broker.
    /// Sender enqueues are themselves deferred there, so reading the count
    /// anywhere else can observe a queue that looks much emptier than it is
    /// about to become.
    async fn pending_bytes(&self, stream: &StreamRef) -> Option<usize> {
        let stream = stream.clone();
        self.router
            .broker()
            .defer(move || stream.pending_bytes())
            .await
            .ok()
    }

    /// Pump chunks for one stream until its backlog reaches the configured
    /// bound or its FIFO empties. The backlog may overspill the bound by up
    /// to one chunk.
    async fn pump_stream(&mut self, stream_id: StreamId) {
        loop {
            let Some(queue) = self.pending_by_stream.get(&stream_id) else {
                return;
            };
            let stream = queue.stream.clone();
            let Some(pending) = self.pending_bytes(&stream).await else {
                // Broker gone; the shutdown drain closes what remains.
                return;
            };
            if pending >= self.config.max_queue_bytes {
                return;
            }

            let Some(queue) = self.pending_by_stream.get_mut(&stream_id) else {
                return;
            };
            let Some(transfer) = queue.fifo.front_mut() else {
                return;
            };

            let mut buf = BytesMut::with_capacity(self.config.chunk_size);
            let read = transfer.file.read_buf(&mut buf).await;
            match read {
                Ok(0) => {
                    // Fully transferred. Closing the sender terminates the
                    // remote receive loop; popping drops and closes the file.
                    debug!(transfer = %transfer.id, "transfer complete");
                    transfer.sender.close();
                    self.finish_head(stream_id);
                }
                Ok(_) => {
                    if let Err(error) = transfer.sender.send(buf.freeze()) {
                        warn!(transfer = %transfer.id, %error, "send failed; aborting transfer");
                        transfer.sender.close();
                        self.finish_head(stream_id);
                    }
                }
                Err(error) => {
                    warn!(transfer = %transfer.id, %error, "read failed; aborting transfer");
                    transfer.sender.close();
                    self.finish_head(stream_id);
                }
            }
        }
    }

    /// Pop the head transfer, removing the stream's entry when its FIFO
    /// empties.
    fn finish_head(&mut self, stream_id: StreamId) {
        if let Some(queue) = self.pending_by_stream.get_mut(&stream_id) {
            queue.fifo.pop_front();
            if queue.fifo.is_empty() {
                self.pending_by_stream.remove(&stream_id);
            }
        }
    }
}
