//! Static peer list
//!
//! The list is read once at startup. Peers carrying memory hints are upserted
//! immediately; every heartbeat interval each peer is probed and either
//! refreshed (with whatever it reports about itself) or marked dead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{shutdown_signalled, DiscoveryProvider};
use crate::config::{DiscoverySettings, PeerEntry};
use crate::error::Result;
use crate::peer::{NodeTransport, PeerRegistry, Probe};
use crate::types::NodeDescriptor;

/// Result of one probe round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub alive: Vec<String>,
    pub dead: Vec<String>,
}

/// Discovery over a fixed peer list
pub struct ManualDiscovery {
    local_node_id: String,
    peers: Vec<PeerEntry>,
    interval: Duration,
    transport: Arc<dyn NodeTransport>,
}

impl ManualDiscovery {
    pub fn new(
        local_node_id: impl Into<String>,
        peers: Vec<PeerEntry>,
        interval: Duration,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        let local_node_id = local_node_id.into();
        let peers = peers.into_iter().filter(|p| p.id != local_node_id).collect();
        Self {
            local_node_id,
            peers,
            interval,
            transport,
        }
    }

    pub fn from_settings(
        local_node_id: &str,
        settings: &DiscoverySettings,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        Self::new(
            local_node_id,
            settings.peers.clone(),
            settings.heartbeat_interval(),
            transport,
        )
    }

    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    /// Upsert every peer that carries a memory hint
    pub fn seed(&self, registry: &PeerRegistry) -> usize {
        let mut seeded = 0;
        for peer in &self.peers {
            if let Some(free_memory) = peer.free_memory_bytes {
                registry.upsert(NodeDescriptor::new(
                    peer.id.clone(),
                    peer.socket_addr(),
                    free_memory,
                    peer.compute_score.unwrap_or(1.0),
                ));
                seeded += 1;
            }
        }
        seeded
    }

    /// Probe every peer once and apply the outcomes
    pub async fn probe_all(&self, registry: &PeerRegistry) -> ProbeRound {
        let probes = self.peers.iter().map(|peer| async move {
            let target = self.descriptor_for(registry, peer, None);
            (peer, self.transport.ping(&target).await)
        });

        let mut round = ProbeRound::default();
        for (peer, outcome) in join_all(probes).await {
            match outcome {
                Ok(probe) => {
                    let descriptor = self.descriptor_for(registry, peer, Some(&probe));
                    debug!(
                        node_id = %peer.id,
                        rtt_ms = probe.rtt.as_millis() as u64,
                        "Peer probe succeeded"
                    );
                    registry.upsert(descriptor);
                    round.alive.push(peer.id.clone());
                }
                Err(e) => {
                    if registry.mark_dead(&peer.id) {
                        warn!(node_id = %peer.id, address = %peer.socket_addr(), error = %e, "Peer probe failed");
                    }
                    round.dead.push(peer.id.clone());
                }
            }
        }
        round
    }

    /// Descriptor for `peer`: the probe's own report wins, then the last
    /// known values, then the configured hints
    fn descriptor_for(&self, registry: &PeerRegistry, peer: &PeerEntry, probe: Option<&Probe>) -> NodeDescriptor {
        if let Some(announcement) = probe.and_then(|p| p.announcement.as_ref()) {
            let mut descriptor = announcement.to_descriptor();
            // The configured id and address are authoritative
            descriptor.id = peer.id.clone();
            descriptor.address = peer.socket_addr();
            return descriptor;
        }

        let known = registry.get(&peer.id);
        let free_memory = known
            .as_ref()
            .map(|n| n.free_memory_bytes)
            .or(peer.free_memory_bytes)
            .unwrap_or(0);
        let compute_score = known
            .as_ref()
            .map(|n| n.compute_score)
            .or(peer.compute_score)
            .unwrap_or(1.0);
        NodeDescriptor::new(peer.id.clone(), peer.socket_addr(), free_memory, compute_score)
    }

    async fn probe_loop(self: Arc<Self>, registry: Arc<PeerRegistry>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
            let round = self.probe_all(&registry).await;
            debug!(alive = round.alive.len(), dead = round.dead.len(), "Probe round complete");
        }
    }
}

#[async_trait]
impl DiscoveryProvider for ManualDiscovery {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn start(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let seeded = self.seed(&registry);
        info!(
            local_node_id = %self.local_node_id,
            peers = self.peers.len(),
            seeded,
            "Manual discovery started"
        );
        Ok(vec![tokio::spawn(self.probe_loop(registry, shutdown))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockLayerBackend;
    use crate::peer::{InMemoryTransport, LivenessPolicy};

    fn setup() -> (Arc<InMemoryTransport>, Arc<PeerRegistry>, ManualDiscovery) {
        let transport = Arc::new(InMemoryTransport::new());
        transport.add_node("b", Arc::new(MockLayerBackend::new()));
        transport.add_node("c", Arc::new(MockLayerBackend::new()));

        let mut b = PeerEntry::new("b", "10.0.0.2", 7420);
        b.free_memory_bytes = Some(8 << 30);
        let c = PeerEntry::new("c", "10.0.0.3", 7420);
        let own = PeerEntry::new("a", "10.0.0.1", 7420);

        let registry = Arc::new(PeerRegistry::new(LivenessPolicy::new(Duration::from_secs(1), 3)));
        let discovery = ManualDiscovery::new("a", vec![own, b, c], Duration::from_millis(20), transport.clone());
        (transport, registry, discovery)
    }

    #[test]
    fn test_own_entry_skipped_and_hints_seeded() {
        let (_transport, registry, discovery) = setup();
        assert_eq!(discovery.peers().len(), 2);

        assert_eq!(discovery.seed(&registry), 1);
        let b = registry.get("b").unwrap();
        assert_eq!(b.address, "10.0.0.2:7420");
        assert_eq!(b.free_memory_bytes, 8 << 30);
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn test_probe_round_marks_unreachable_dead() {
        let (transport, registry, discovery) = setup();
        discovery.seed(&registry);

        let round = discovery.probe_all(&registry).await;
        assert_eq!(round.alive, vec!["b".to_string(), "c".to_string()]);
        // Hint survives a probe that reports nothing
        assert_eq!(registry.get("b").unwrap().free_memory_bytes, 8 << 30);

        transport.take_down("b");
        let round = discovery.probe_all(&registry).await;
        assert_eq!(round.dead, vec!["b".to_string()]);
        assert!(registry.snapshot().get("b").is_none());
        assert!(registry.snapshot().get("c").is_some());

        transport.bring_up("b");
        discovery.probe_all(&registry).await;
        assert!(registry.snapshot().get("b").is_some());
    }

    #[tokio::test]
    async fn test_probe_loop_stops_on_shutdown() {
        let (transport, registry, discovery) = setup();
        let (tx, rx) = watch::channel(false);
        let handles = Arc::new(discovery).start(registry.clone(), rx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(transport.ping_count() >= 2);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
