//! Host side of the message channel.
//!
//! Owns the pending-request map and the monotonic id counter. Every
//! outgoing request registers a one-shot slot keyed by id; the router
//! task resolves slots as replies arrive and fans events out to
//! subscribers. Timeouts remove the slot first, so a late reply finds
//! nothing and is dropped with a debug line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vessel_protocol::{
    ContainerError, HostFrame, RequestId, Result, WorkerEvent, WorkerFrame, WorkerReply,
    WorkerRequest,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct BridgeShared {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<WorkerReply>>>,
    events: broadcast::Sender<WorkerEvent>,
}

/// Correlation layer between the embedder-facing API and the worker task.
pub struct WorkerBridge {
    tx: mpsc::UnboundedSender<HostFrame>,
    shared: Arc<BridgeShared>,
    next_id: AtomicU64,
    timeout: Duration,
    disposed: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerBridge {
    /// Wire the bridge onto an existing channel pair and start the
    /// router task.
    pub fn new(
        tx: mpsc::UnboundedSender<HostFrame>,
        mut rx: mpsc::UnboundedReceiver<WorkerFrame>,
        timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(BridgeShared {
            pending: Mutex::new(HashMap::new()),
            events,
        });

        let router_shared = Arc::clone(&shared);
        let router = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    WorkerFrame::Reply { id, reply } => {
                        let slot = router_shared
                            .pending
                            .lock()
                            .expect("pending map poisoned")
                            .remove(&id);
                        match slot {
                            Some(sender) => {
                                let _ = sender.send(reply);
                            }
                            None => debug!(id, "dropping late reply"),
                        }
                    }
                    WorkerFrame::Event { event } => {
                        // No subscribers is fine; events are broadcast.
                        let _ = router_shared.events.send(event);
                    }
                }
            }
        });

        Self {
            tx,
            shared,
            next_id: AtomicU64::new(1),
            timeout: timeout.max(Duration::from_millis(1)),
            disposed: AtomicBool::new(false),
            router: Mutex::new(Some(router)),
        }
    }

    /// Subscribe to unsolicited worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Send one correlated request and await its reply.
    ///
    /// An `error` reply surfaces as `ContainerError::Worker`; a timeout
    /// removes the pending slot so the eventual reply is dropped.
    pub async fn request(&self, request: WorkerRequest) -> Result<WorkerReply> {
        if self.is_disposed() {
            return Err(ContainerError::WorkerDisposed);
        }
        self.send_request(request).await
    }

    async fn send_request(&self, request: WorkerRequest) -> Result<WorkerReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, reply_tx);

        if self.tx.send(HostFrame { id, request }).is_err() {
            self.shared
                .pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            return Err(ContainerError::WorkerDisposed);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(WorkerReply::Error { error })) => Err(ContainerError::Worker(error)),
            Ok(Ok(reply)) => Ok(reply),
            // Slot dropped during teardown.
            Ok(Err(_)) => Err(ContainerError::WorkerDisposed),
            Err(_) => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                Err(ContainerError::Timeout {
                    ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Tear the channel down: refuse new requests, reject everything
    /// pending with "worker disposed", then attempt one best-effort
    /// dispose round trip before the router stops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let rejected: usize = {
            let mut pending = self.shared.pending.lock().expect("pending map poisoned");
            let count = pending.len();
            // Dropping the senders wakes every waiter with a closed
            // channel, which maps to "worker disposed".
            pending.clear();
            count
        };
        if rejected > 0 {
            warn!(rejected, "rejected pending requests on dispose");
        }

        match tokio::time::timeout(
            Duration::from_millis(500),
            self.send_request(WorkerRequest::Dispose),
        )
        .await
        {
            Ok(Ok(WorkerReply::Disposed)) => debug!("worker acknowledged dispose"),
            Ok(other) => debug!(?other, "dispose round trip did not complete cleanly"),
            Err(_) => debug!("dispose round trip timed out"),
        }

        if let Some(router) = self.router.lock().expect("router slot poisoned").take() {
            router.abort();
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }
}
