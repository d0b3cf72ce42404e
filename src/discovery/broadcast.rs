//! Local-segment discovery
//!
//! Every heartbeat interval the node sends its own announcement as one UDP
//! datagram to the broadcast address, and upserts every announcement it
//! hears from other nodes. Silence is handled by the registry sweep. The
//! socket belongs to the running loops and is closed when they exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{shutdown_signalled, DiscoveryProvider};
use crate::config::DiscoverySettings;
use crate::error::{Error, Result};
use crate::peer::PeerRegistry;
use crate::protocol::{Announcement, Message, MessageEnvelope, PROTOCOL_VERSION};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 8 * 1024;

/// Broadcast presence discovery
pub struct BroadcastDiscovery {
    local_node_id: String,
    bind_addr: SocketAddr,
    target: SocketAddr,
    interval: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl BroadcastDiscovery {
    pub fn new(
        local_node_id: impl Into<String>,
        bind_addr: SocketAddr,
        target: SocketAddr,
        interval: Duration,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            bind_addr,
            target,
            interval,
            socket: Mutex::new(None),
        }
    }

    pub fn from_settings(local_node_id: &str, settings: &DiscoverySettings) -> Result<Self> {
        let target: SocketAddr = format!("{}:{}", settings.broadcast_addr, settings.broadcast_port)
            .parse()
            .map_err(|e| {
                Error::config_field_invalid(
                    "discovery.broadcast_addr",
                    format!("Invalid broadcast address '{}': {}", settings.broadcast_addr, e),
                )
            })?;
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], settings.broadcast_port));
        Ok(Self::new(local_node_id, bind_addr, target, settings.heartbeat_interval()))
    }

    /// Bind the UDP socket; returns the bound address
    pub async fn bind(&self) -> Result<SocketAddr> {
        if let Some(socket) = self.socket.lock().as_ref() {
            return Ok(socket.local_addr()?);
        }

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| Error::Discovery(format!("cannot bind {}: {}", self.bind_addr, e)))?;
        socket.set_broadcast(true)?;
        let addr = socket.local_addr()?;
        *self.socket.lock() = Some(Arc::new(socket));
        Ok(addr)
    }

    /// Hand the bound socket over to the loops
    fn take_socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .take()
            .ok_or_else(|| Error::Discovery("broadcast socket not bound".into()))
    }

    /// Apply one received datagram; returns the upserted node id
    pub fn handle_datagram(&self, registry: &PeerRegistry, bytes: &[u8]) -> Option<String> {
        let envelope: MessageEnvelope = match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                trace!(error = %e, "Ignoring malformed announcement");
                return None;
            }
        };
        if PROTOCOL_VERSION.check_peer(&envelope.version).is_err() {
            debug!(version = %envelope.version, "Ignoring announcement from incompatible peer");
            return None;
        }

        match envelope.payload {
            Message::Announce(announcement) if announcement.node_id != self.local_node_id => {
                registry.upsert(announcement.to_descriptor());
                Some(announcement.node_id)
            }
            _ => None,
        }
    }

    /// Encode this node's current announcement, if it is registered
    fn own_announcement(&self, registry: &PeerRegistry) -> Option<Vec<u8>> {
        let node = registry.get(&self.local_node_id)?;
        let envelope = MessageEnvelope::new(Message::Announce(Announcement::from_descriptor(&node)));
        serde_json::to_vec(&envelope).ok()
    }

    async fn announce_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        registry: Arc<PeerRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }

            let Some(packet) = self.own_announcement(&registry) else {
                // Non-participating nodes listen only
                continue;
            };
            match socket.send_to(&packet, self.target).await {
                Ok(sent) => trace!(target = %self.target, bytes = sent, "Announcement sent"),
                Err(e) => warn!(target = %self.target, error = %e, "Failed to send announcement"),
            }
        }
    }

    async fn listen_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        registry: Arc<PeerRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Some(node_id) = self.handle_datagram(&registry, &buf[..len]) {
                            trace!(node_id = %node_id, from = %from, "Announcement received");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Announcement receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }
}

#[async_trait]
impl DiscoveryProvider for BroadcastDiscovery {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn start(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let addr = self.bind().await?;
        let socket = self.take_socket()?;
        info!(addr = %addr, target = %self.target, "Broadcast discovery started");

        let announcer = tokio::spawn(Arc::clone(&self).announce_loop(
            Arc::clone(&socket),
            Arc::clone(&registry),
            shutdown.clone(),
        ));
        let listener = tokio::spawn(self.listen_loop(socket, registry, shutdown));
        Ok(vec![announcer, listener])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LivenessPolicy;
    use crate::types::NodeDescriptor;

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::new(LivenessPolicy::new(Duration::from_millis(50), 3)))
    }

    fn announce(node_id: &str) -> Vec<u8> {
        let node = NodeDescriptor::new(node_id, "10.0.0.9:7420", 4 << 30, 2.0);
        serde_json::to_vec(&MessageEnvelope::new(Message::Announce(
            Announcement::from_descriptor(&node),
        )))
        .unwrap()
    }

    fn local(interval_ms: u64) -> BroadcastDiscovery {
        BroadcastDiscovery::new(
            "self",
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(interval_ms),
        )
    }

    #[test]
    fn test_handle_datagram() {
        let registry = registry();
        let discovery = local(50);

        assert_eq!(discovery.handle_datagram(&registry, &announce("b")), Some("b".into()));
        assert_eq!(registry.get("b").unwrap().free_memory_bytes, 4 << 30);

        // Own announcements and garbage are ignored
        assert_eq!(discovery.handle_datagram(&registry, &announce("self")), None);
        assert_eq!(discovery.handle_datagram(&registry, b"not json"), None);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_two_nodes_find_each_other() {
        let registry_a = registry();
        let registry_b = registry();

        // Bind both first so each knows where to send
        let a = BroadcastDiscovery::new(
            "a",
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(20),
        );
        let addr_a = a.bind().await.unwrap();
        let b = Arc::new(BroadcastDiscovery::new(
            "b",
            "127.0.0.1:0".parse().unwrap(),
            addr_a,
            Duration::from_millis(20),
        ));
        b.bind().await.unwrap();

        registry_b.upsert(NodeDescriptor::new("b", "127.0.0.1:7001", 2 << 30, 1.0));

        let (tx, rx) = watch::channel(false);
        let mut handles = Arc::new(a).start(registry_a.clone(), rx.clone()).await.unwrap();
        handles.extend(b.start(registry_b, rx).await.unwrap());

        let mut heard = false;
        for _ in 0..50 {
            if registry_a.get("b").is_some() {
                heard = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(heard, "node a never heard node b");

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_port_is_released_after_shutdown() {
        let discovery = Arc::new(local(20));
        let addr = discovery.bind().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handles = Arc::clone(&discovery).start(registry(), rx).await.unwrap();
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let rebound = UdpSocket::bind(addr).await.unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
    }
}
