//! First-hop batching
//!
//! Wraps a [`NodeTransport`]. First hops of distinct requests bound for the
//! same node, model and layer range within one batch window are sent as a
//! single batch call. Only transport calls are shared; every request still
//! gets its own response, identical to what an unbatched hop would return.
//! Later hops pass straight through. Once closed, every hop fails with
//! [`Error::ServiceStopped`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, trace};

use crate::config::ServiceSettings;
use crate::error::{Error, Result};
use crate::peer::{NodeTransport, Probe};
use crate::protocol::{HopRequest, HopResponse};
use crate::types::{LayerRange, NodeDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    node_id: String,
    model_id: String,
    layers: LayerRange,
    is_last: bool,
}

impl BatchKey {
    fn of(node: &NodeDescriptor, request: &HopRequest) -> Self {
        Self {
            node_id: node.id.clone(),
            model_id: request.model_id.clone(),
            layers: request.layers,
            is_last: request.is_last,
        }
    }
}

type Reply = oneshot::Sender<Result<HopResponse>>;

struct PendingBatch {
    id: u64,
    node: NodeDescriptor,
    requests: Vec<HopRequest>,
    replies: Vec<Reply>,
}

struct BatchCore {
    inner: Arc<dyn NodeTransport>,
    window: Duration,
    max_batch_size: usize,
    permits: Semaphore,
    closed: AtomicBool,
    pending: Mutex<HashMap<BatchKey, PendingBatch>>,
    next_id: AtomicU64,
    batches_sent: AtomicU64,
    hops_sent: AtomicU64,
}

/// [`NodeTransport`] decorator grouping first hops
pub struct BatchingTransport {
    core: Arc<BatchCore>,
}

impl BatchingTransport {
    pub fn new(
        inner: Arc<dyn NodeTransport>,
        window: Duration,
        max_batch_size: usize,
        max_in_flight_batches: usize,
    ) -> Self {
        Self {
            core: Arc::new(BatchCore {
                inner,
                window,
                max_batch_size: max_batch_size.max(1),
                permits: Semaphore::new(max_in_flight_batches.max(1)),
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                batches_sent: AtomicU64::new(0),
                hops_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_settings(inner: Arc<dyn NodeTransport>, settings: &ServiceSettings) -> Self {
        Self::new(
            inner,
            settings.batch_window(),
            settings.max_batch_size,
            settings.max_in_flight_batches,
        )
    }

    /// Transport calls made for first hops (batched or single)
    pub fn batches_sent(&self) -> u64 {
        self.core.batches_sent.load(Ordering::Relaxed)
    }

    /// First hops delivered through those calls
    pub fn hops_sent(&self) -> u64 {
        self.core.hops_sent.load(Ordering::Relaxed)
    }

    /// Queue a first hop; returns the receiver for its response
    fn enqueue(&self, node: &NodeDescriptor, request: HopRequest) -> oneshot::Receiver<Result<HopResponse>> {
        let (tx, rx) = oneshot::channel();
        let key = BatchKey::of(node, &request);

        let mut pending = self.core.pending.lock();
        match pending.get_mut(&key) {
            Some(batch) => {
                batch.requests.push(request);
                batch.replies.push(tx);
                if batch.requests.len() >= self.core.max_batch_size {
                    // Full: send now instead of waiting out the window
                    if let Some(full) = pending.remove(&key) {
                        tokio::spawn(Arc::clone(&self.core).flush(full));
                    }
                }
            }
            None => {
                let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
                pending.insert(
                    key.clone(),
                    PendingBatch {
                        id,
                        node: node.clone(),
                        requests: vec![request],
                        replies: vec![tx],
                    },
                );
                if self.core.max_batch_size == 1 {
                    if let Some(single) = pending.remove(&key) {
                        tokio::spawn(Arc::clone(&self.core).flush(single));
                    }
                } else {
                    tokio::spawn(Arc::clone(&self.core).flush_after_window(key, id));
                }
            }
        }
        rx
    }
}

impl BatchCore {
    async fn flush_after_window(self: Arc<Self>, key: BatchKey, id: u64) {
        tokio::time::sleep(self.window).await;
        let batch = {
            let mut pending = self.pending.lock();
            // Already flushed if it filled up during the window
            if pending.get(&key).map(|b| b.id) == Some(id) {
                pending.remove(&key)
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.flush(batch).await;
        }
    }

    async fn flush(self: Arc<Self>, batch: PendingBatch) {
        let PendingBatch {
            node,
            requests,
            replies,
            ..
        } = batch;

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                for reply in replies {
                    let _ = reply.send(Err(Error::ServiceStopped));
                }
                return;
            }
        };

        let count = requests.len();
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.hops_sent.fetch_add(count as u64, Ordering::Relaxed);

        if count == 1 {
            let result = match requests.into_iter().next() {
                Some(request) => self.inner.send_hop(&node, request).await,
                None => return,
            };
            if let Some(reply) = replies.into_iter().next() {
                let _ = reply.send(result);
            }
            return;
        }

        debug!(node_id = %node.id, hops = count, "Sending first-hop batch");
        match self.inner.send_batch(&node, requests).await {
            Ok(responses) if responses.len() == count => {
                for (reply, response) in replies.into_iter().zip(responses) {
                    let _ = reply.send(Ok(response));
                }
            }
            Ok(responses) => {
                let message = format!("batch of {} hops answered with {} responses", count, responses.len());
                for reply in replies {
                    let _ = reply.send(Err(Error::Protocol(message.clone())));
                }
            }
            Err(e) => {
                trace!(node_id = %node.id, error = %e, "Batch call failed");
                let message = e.to_string();
                for reply in replies {
                    let _ = reply.send(Err(Error::connection_failed(&node.address, message.clone())));
                }
            }
        }
    }
}

#[async_trait]
impl NodeTransport for BatchingTransport {
    async fn send_hop(&self, node: &NodeDescriptor, request: HopRequest) -> Result<HopResponse> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(Error::ServiceStopped);
        }
        if request.hop_index != 0 || self.core.window.is_zero() {
            return self.core.inner.send_hop(node, request).await;
        }

        self.enqueue(node, request)
            .await
            .map_err(|_| Error::ServiceStopped)?
    }

    async fn send_batch(&self, node: &NodeDescriptor, requests: Vec<HopRequest>) -> Result<Vec<HopResponse>> {
        self.core.inner.send_batch(node, requests).await
    }

    async fn ping(&self, node: &NodeDescriptor) -> Result<Probe> {
        self.core.inner.ping(node).await
    }

    async fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
        self.core.permits.close();
        let abandoned: Vec<PendingBatch> = self.core.pending.lock().drain().map(|(_, b)| b).collect();
        for batch in abandoned {
            for reply in batch.replies {
                let _ = reply.send(Err(Error::ServiceStopped));
            }
        }
        self.core.inner.close().await;
    }
}
