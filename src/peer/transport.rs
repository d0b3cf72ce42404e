//! Node transport
//!
//! [`NodeTransport`] is the seam between the pipeline executor and the
//! network. [`TcpTransport`] dials peers directly and keeps a small pool of
//! idle connections per address; each exchange is one request frame followed
//! by one reply frame on the same connection, so replies stay ordered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::frame::{read_framed_message, write_framed_message};
use crate::backend::LayerBackend;
use crate::config::TransportSettings;
use crate::error::{Error, Result};
use crate::protocol::{
    Announcement, HopBatchRequest, HopRequest, HopResponse, Message, MessageEnvelope,
    PROTOCOL_VERSION,
};
use crate::types::NodeDescriptor;

// ─────────────────────────────────────────────────────────────────
// NodeTransport Trait
// ─────────────────────────────────────────────────────────────────

/// Carries hops to nodes
///
/// Transport-level failures are returned as errors; a node that ran the hop
/// and failed answers with a `Failed` [`HopResponse`]. Per-call timeouts are
/// applied by the caller.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Execute one hop on `node`
    async fn send_hop(&self, node: &NodeDescriptor, request: HopRequest) -> Result<HopResponse>;

    /// Execute several hops on `node`; responses keep request order
    async fn send_batch(
        &self,
        node: &NodeDescriptor,
        requests: Vec<HopRequest>,
    ) -> Result<Vec<HopResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.send_hop(node, request).await?);
        }
        Ok(responses)
    }

    /// Round-trip a liveness probe
    async fn ping(&self, node: &NodeDescriptor) -> Result<Probe>;

    /// Drop any held connections
    async fn close(&self) {}
}

/// Answer to a liveness probe
#[derive(Debug, Clone)]
pub struct Probe {
    pub rtt: Duration,

    /// The node's own view of its capabilities, if it reported one
    pub announcement: Option<Announcement>,
}

impl Probe {
    pub fn local() -> Self {
        Self {
            rtt: Duration::ZERO,
            announcement: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// TCP Transport
// ─────────────────────────────────────────────────────────────────

/// Idle connections kept per peer address
const MAX_IDLE_PER_PEER: usize = 4;

/// Executes hops on the local engine without touching the network
struct LocalNode {
    node_id: String,
    backend: Arc<dyn LayerBackend>,
}

/// [`NodeTransport`] over direct TCP connections
pub struct TcpTransport {
    connect_timeout: Duration,
    max_message_bytes: u32,
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    local: Option<LocalNode>,
    seq: std::sync::atomic::AtomicU64,
}

impl TcpTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            max_message_bytes: settings.max_message_bytes,
            idle: Mutex::new(HashMap::new()),
            local: None,
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Serve hops addressed to `node_id` in-process
    pub fn with_local_node(mut self, node_id: impl Into<String>, backend: Arc<dyn LayerBackend>) -> Self {
        self.local = Some(LocalNode {
            node_id: node_id.into(),
            backend,
        });
        self
    }

    fn local_for(&self, node: &NodeDescriptor) -> Option<&LocalNode> {
        self.local.as_ref().filter(|l| l.node_id == node.id)
    }

    /// Number of pooled idle connections
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    async fn connect(&self, addr: &str) -> anyhow::Result<TcpStream> {
        let pooled = self.idle.lock().get_mut(addr).and_then(Vec::pop);
        if let Some(stream) = pooled {
            return Ok(stream);
        }

        trace!(addr = %addr, "Dialing peer");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("Connection timeout"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn release(&self, addr: &str, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let pool = idle.entry(addr.to_string()).or_default();
        if pool.len() < MAX_IDLE_PER_PEER {
            pool.push(stream);
        }
    }

    /// One request/reply exchange with the node at `addr`
    async fn exchange(&self, addr: &str, message: Message) -> Result<Message> {
        let request = MessageEnvelope::new(message);
        let mut stream = self
            .connect(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e.to_string()))?;

        let reply = async {
            write_framed_message(&mut stream, &request, self.max_message_bytes).await?;
            read_framed_message(&mut stream, self.max_message_bytes).await
        }
        .await
        .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;

        if reply.id != request.id {
            return Err(Error::Protocol(format!(
                "reply from {} does not match request {}",
                addr, request.id
            )));
        }
        PROTOCOL_VERSION.check_peer(&reply.version)?;

        self.release(addr, stream);
        match reply.payload {
            Message::Error(err) => Err(Error::Protocol(format!(
                "{} rejected {}: [{}] {}",
                addr,
                request.payload.type_name(),
                err.code.as_str(),
                err.message
            ))),
            payload => Ok(payload),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(&TransportSettings::default())
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn send_hop(&self, node: &NodeDescriptor, request: HopRequest) -> Result<HopResponse> {
        if let Some(local) = self.local_for(node) {
            return Ok(run_local_hop(local.backend.as_ref(), request).await);
        }

        match self.exchange(&node.address, Message::Hop(request)).await? {
            Message::HopResult(response) => Ok(response),
            other => Err(Error::Protocol(format!(
                "expected HOP_RESULT from {}, got {}",
                node.id,
                other.type_name()
            ))),
        }
    }

    async fn send_batch(
        &self,
        node: &NodeDescriptor,
        requests: Vec<HopRequest>,
    ) -> Result<Vec<HopResponse>> {
        if let Some(local) = self.local_for(node) {
            return Ok(run_local_batch(local.backend.as_ref(), requests).await);
        }

        let expected = requests.len();
        let batch = Message::HopBatch(HopBatchRequest { requests });
        match self.exchange(&node.address, batch).await? {
            Message::HopBatchResult(result) if result.responses.len() == expected => {
                Ok(result.responses)
            }
            Message::HopBatchResult(result) => Err(Error::Protocol(format!(
                "{} answered {} of {} batched hops",
                node.id,
                result.responses.len(),
                expected
            ))),
            other => Err(Error::Protocol(format!(
                "expected HOP_BATCH_RESULT from {}, got {}",
                node.id,
                other.type_name()
            ))),
        }
    }

    async fn ping(&self, node: &NodeDescriptor) -> Result<Probe> {
        if self.local_for(node).is_some() {
            return Ok(Probe::local());
        }

        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let started = Instant::now();
        match self.exchange(&node.address, Message::Ping { seq }).await? {
            Message::Pong {
                seq: echoed,
                node: announcement,
                ..
            } if echoed == seq => Ok(Probe {
                rtt: started.elapsed(),
                announcement,
            }),
            other => Err(Error::Protocol(format!(
                "unexpected {} reply to ping from {}",
                other.type_name(),
                node.id
            ))),
        }
    }

    async fn close(&self) {
        let dropped = {
            let mut idle = self.idle.lock();
            let count: usize = idle.values().map(Vec::len).sum();
            idle.clear();
            count
        };
        debug!(connections = dropped, "Transport closed");
    }
}

// ─────────────────────────────────────────────────────────────────
// Hop execution on a local engine
// ─────────────────────────────────────────────────────────────────

/// Run a hop on `backend`, folding engine errors into a `Failed` response
pub async fn run_local_hop(backend: &dyn LayerBackend, request: HopRequest) -> HopResponse {
    let started = Instant::now();
    let result = backend
        .run_layers(&request.model_id, request.layers, request.input, request.is_last)
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(output) => HopResponse::ok(output.activation, latency_ms, output.tokens_generated),
        Err(e) => HopResponse::failed(e.to_string(), latency_ms),
    }
}

/// Run a batch of hops, grouping those that share model, range and finality
pub async fn run_local_batch(backend: &dyn LayerBackend, requests: Vec<HopRequest>) -> Vec<HopResponse> {
    let total = requests.len();
    let mut responses: Vec<Option<HopResponse>> = vec![None; total];

    let mut groups: Vec<(String, crate::types::LayerRange, bool, Vec<usize>)> = Vec::new();
    for (index, request) in requests.iter().enumerate() {
        match groups.iter_mut().find(|(model, layers, last, _)| {
            *model == request.model_id && *layers == request.layers && *last == request.is_last
        }) {
            Some(group) => group.3.push(index),
            None => groups.push((request.model_id.clone(), request.layers, request.is_last, vec![index])),
        }
    }

    let mut inputs: Vec<Option<Vec<u8>>> = requests.into_iter().map(|r| Some(r.input)).collect();
    for (model_id, layers, is_last, indices) in groups {
        let batch: Vec<Vec<u8>> = indices
            .iter()
            .map(|i| inputs[*i].take().unwrap_or_default())
            .collect();

        let started = Instant::now();
        let outputs = backend.run_batch(&model_id, layers, batch, is_last).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        for (slot, output) in indices.into_iter().zip(outputs) {
            responses[slot] = Some(match output {
                Ok(out) => HopResponse::ok(out.activation, latency_ms, out.tokens_generated),
                Err(e) => HopResponse::failed(e.to_string(), latency_ms),
            });
        }
    }

    responses
        .into_iter()
        .map(|r| r.unwrap_or_else(|| HopResponse::failed("engine returned too few outputs", 0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockConfig, MockLayerBackend};
    use crate::types::{InferenceRequest, LayerRange};

    fn hop(input: &[u8], start: u32, end: u32, is_last: bool) -> HopRequest {
        HopRequest {
            model_id: "m".into(),
            layers: LayerRange::new(start, end),
            input: input.to_vec(),
            fingerprint: InferenceRequest::new("m", "x").fingerprint(),
            hop_index: 0,
            is_last,
        }
    }

    #[tokio::test]
    async fn test_local_hop_short_circuits_network() {
        let backend = Arc::new(MockLayerBackend::new());
        let transport = TcpTransport::default().with_local_node("self", backend.clone());
        // Address is unroutable; the hop must not dial it
        let node = NodeDescriptor::new("self", "0.0.0.0:1", 1, 1.0);

        let resp = transport.send_hop(&node, hop(b"x", 0, 2, true)).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.output, b"x[0..2)".to_vec());
        assert_eq!(resp.tokens_generated, Some(16));
        assert_eq!(transport.ping(&node).await.unwrap().rtt, Duration::ZERO);
        assert_eq!(backend.call_count("run_layers"), 1);
    }

    #[tokio::test]
    async fn test_local_engine_error_becomes_failed_response() {
        let backend = MockLayerBackend::with_config(MockConfig {
            fail_runs: true,
            ..MockConfig::default()
        });
        let resp = run_local_hop(&backend, hop(b"x", 0, 2, false)).await;
        assert!(!resp.is_ok());
        assert!(resp.error.unwrap().contains("mock failure"));
    }

    #[tokio::test]
    async fn test_local_batch_groups_by_range() {
        let backend = MockLayerBackend::new();
        let responses = run_local_batch(
            &backend,
            vec![hop(b"a", 0, 4, false), hop(b"b", 4, 8, false), hop(b"c", 0, 4, false)],
        )
        .await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].output, b"a[0..4)".to_vec());
        assert_eq!(responses[1].output, b"b[4..8)".to_vec());
        assert_eq!(responses[2].output, b"c[0..4)".to_vec());
        assert_eq!(backend.call_count("run_batch"), 2);
        assert_eq!(backend.call_count("batched_inputs"), 3);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_connection_error() {
        let transport = TcpTransport::new(&TransportSettings {
            connect_timeout_ms: 200,
            ..TransportSettings::default()
        });
        // Reserved port on localhost with nothing listening
        let node = NodeDescriptor::new("remote", "127.0.0.1:1", 1, 1.0);
        let err = transport.send_hop(&node, hop(b"x", 0, 1, false)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
