//! Hop server
//!
//! Accepts TCP connections from peers and executes the hops they send on the
//! local layer engine. Each connection carries a sequence of request frames,
//! each answered with exactly one reply frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::frame::{read_framed_message, write_framed_message};
use super::transport::{run_local_batch, run_local_hop};
use super::PeerRegistry;
use crate::backend::LayerBackend;
use crate::error::{Error, Result};
use crate::protocol::{
    Announcement, ErrorMessage, HopBatchResponse, Message, MessageEnvelope, PROTOCOL_VERSION,
};

/// Serves hops for the local node
pub struct NodeServer {
    node_id: String,
    backend: Arc<dyn LayerBackend>,
    max_message_bytes: u32,
    /// Source of this node's own descriptor for probe replies
    registry: Option<Arc<PeerRegistry>>,
    listener_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeServer {
    pub fn new(
        node_id: impl Into<String>,
        backend: Arc<dyn LayerBackend>,
        max_message_bytes: u32,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            backend,
            max_message_bytes,
            registry: None,
            listener_addr: RwLock::new(None),
            shutdown_tx,
            accept_task: Mutex::new(None),
        }
    }

    /// Answer probes with this node's registry entry
    pub fn with_registry(mut self, registry: Arc<PeerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind the listener and return the bound address
    pub async fn start(self: &Arc<Self>, bind_addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::connection_failed(bind_addr.to_string(), e.to_string()))?;
        let addr = listener.local_addr()?;

        *self.listener_addr.write() = Some(addr);
        info!(addr = %addr, node_id = %self.node_id, "Hop server listening");

        let server = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            server.accept_loop(listener, shutdown_rx).await;
        });
        *self.accept_task.lock() = Some(handle);

        Ok(addr)
    }

    /// The bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listener_addr.read()
    }

    /// Stop accepting, close every connection and wait for the tasks to end
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.accept_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Hop server task ended abnormally");
            }
        }
        *self.listener_addr.write() = None;
        debug!(node_id = %self.node_id, "Hop server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer_addr = %peer_addr, "Incoming peer connection");
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = server.handle_connection(stream, shutdown).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Peer connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        // Dropping the listener closes the port; open connections are aborted
        drop(listener);
        connections.shutdown().await;
    }

    /// Serve request frames until the peer hangs up or the server stops
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;

        loop {
            let envelope = tokio::select! {
                read = read_framed_message(&mut stream, self.max_message_bytes) => read?,
                _ = shutdown.changed() => return Ok(()),
            };

            let reply = self.dispatch(&envelope).await;
            write_framed_message(&mut stream, &reply, self.max_message_bytes).await?;
        }
    }

    async fn dispatch(&self, envelope: &MessageEnvelope) -> MessageEnvelope {
        if let Err(e) = PROTOCOL_VERSION.check_peer(&envelope.version) {
            warn!(peer_version = %envelope.version, "Rejecting incompatible peer");
            return envelope.reply(Message::Error(ErrorMessage::from(&e)));
        }

        let payload = match &envelope.payload {
            Message::Hop(request) => {
                debug!(
                    fingerprint = %request.fingerprint.short(),
                    model_id = %request.model_id,
                    layers = %request.layers,
                    "Serving hop"
                );
                Message::HopResult(run_local_hop(self.backend.as_ref(), request.clone()).await)
            }
            Message::HopBatch(batch) => {
                debug!(hops = batch.requests.len(), "Serving hop batch");
                let responses = run_local_batch(self.backend.as_ref(), batch.requests.clone()).await;
                Message::HopBatchResult(HopBatchResponse { responses })
            }
            Message::Ping { seq } => Message::Pong {
                seq: *seq,
                node_id: self.node_id.clone(),
                node: self
                    .registry
                    .as_ref()
                    .and_then(|registry| registry.get(&self.node_id))
                    .map(|node| Announcement::from_descriptor(&node)),
            },
            other => {
                let err = Error::Protocol(format!("unexpected {} request", other.type_name()));
                Message::Error(ErrorMessage::from(&err))
            }
        };
        envelope.reply(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockLayerBackend;
    use crate::config::TransportSettings;
    use crate::peer::{NodeTransport, TcpTransport};
    use crate::protocol::HopRequest;
    use crate::types::{InferenceRequest, LayerRange, NodeDescriptor};

    async fn start_server() -> (Arc<NodeServer>, Arc<MockLayerBackend>, NodeDescriptor) {
        let backend = Arc::new(MockLayerBackend::new());
        let server = Arc::new(NodeServer::new("remote", backend.clone(), 1024 * 1024));
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let node = NodeDescriptor::new("remote", addr.to_string(), 1, 1.0);
        (server, backend, node)
    }

    fn hop(input: &[u8], start: u32, end: u32) -> HopRequest {
        HopRequest {
            model_id: "m".into(),
            layers: LayerRange::new(start, end),
            input: input.to_vec(),
            fingerprint: InferenceRequest::new("m", "x").fingerprint(),
            hop_index: 0,
            is_last: false,
        }
    }

    #[tokio::test]
    async fn test_hop_over_tcp() {
        let (server, backend, node) = start_server().await;
        let transport = TcpTransport::default();

        let first = transport.send_hop(&node, hop(b"in", 0, 8)).await.unwrap();
        assert!(first.is_ok());
        assert_eq!(first.output, b"in[0..8)".to_vec());

        // Second hop reuses the pooled connection
        assert_eq!(transport.idle_connections(), 1);
        let second = transport.send_hop(&node, hop(&first.output, 8, 12)).await.unwrap();
        assert_eq!(second.output, b"in[0..8)[8..12)".to_vec());
        assert_eq!(transport.idle_connections(), 1);
        assert_eq!(backend.call_count("run_layers"), 2);

        transport.close().await;
        assert_eq!(transport.idle_connections(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_batch_and_ping_over_tcp() {
        let (server, backend, node) = start_server().await;
        let transport = TcpTransport::default();

        let responses = transport
            .send_batch(&node, vec![hop(b"a", 0, 4), hop(b"b", 0, 4)])
            .await
            .unwrap();
        assert_eq!(responses[0].output, b"a[0..4)".to_vec());
        assert_eq!(responses[1].output, b"b[0..4)".to_vec());
        assert_eq!(backend.call_count("run_batch"), 1);

        assert!(transport.ping(&node).await.is_ok());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ping_reports_own_descriptor() {
        use crate::peer::LivenessPolicy;

        let registry = Arc::new(PeerRegistry::new(LivenessPolicy::new(Duration::from_secs(1), 3)));
        let backend = Arc::new(MockLayerBackend::new());
        let server = Arc::new(
            NodeServer::new("remote", backend, 1024 * 1024).with_registry(registry.clone()),
        );
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        registry.upsert(NodeDescriptor::new("remote", addr.to_string(), 6 << 30, 3.0));

        let node = NodeDescriptor::new("remote", addr.to_string(), 0, 0.0);
        let probe = TcpTransport::default().ping(&node).await.unwrap();
        let announced = probe.announcement.expect("announcement");
        assert_eq!(announced.node_id, "remote");
        assert_eq!(announced.free_memory_bytes, 6 << 30);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_server_refuses_hops() {
        let (server, _backend, node) = start_server().await;
        server.stop().await;
        assert!(server.local_addr().is_none());

        let transport = TcpTransport::new(&TransportSettings {
            connect_timeout_ms: 500,
            ..TransportSettings::default()
        });
        let err = transport.send_hop(&node, hop(b"x", 0, 1)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
