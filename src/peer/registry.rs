//! Peer registry: known nodes, their capacity and liveness
//!
//! Discovery providers and the pipeline executor are the only writers.
//! All mutation goes through one lock, and every change that affects the set
//! of ALIVE nodes publishes a new immutable [`ClusterView`] with a higher
//! version on a watch channel. Readers take an `Arc` snapshot and never see a
//! half-applied update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::{NodeDescriptor, NodeStatus};

// ─────────────────────────────────────────────────────────────────
// Cluster View
// ─────────────────────────────────────────────────────────────────

/// Immutable snapshot of the ALIVE nodes, ordered by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterView {
    /// Monotonically increasing; bumped on every membership change
    pub version: u64,

    /// ALIVE nodes sorted by id, one descriptor per id
    pub nodes: Vec<NodeDescriptor>,
}

impl ClusterView {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeDescriptor> {
        self.nodes
            .binary_search_by(|n| n.id.as_str().cmp(node_id))
            .ok()
            .map(|i| &self.nodes[i])
    }

    /// Sum of free memory over all nodes
    pub fn total_free_memory(&self) -> u64 {
        self.nodes.iter().map(|n| n.free_memory_bytes).sum()
    }

    /// Copy of this view without the given nodes (version unchanged)
    pub fn without(&self, excluded: &[String]) -> ClusterView {
        ClusterView {
            version: self.version,
            nodes: self
                .nodes
                .iter()
                .filter(|n| !excluded.contains(&n.id))
                .cloned()
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Liveness Policy
// ─────────────────────────────────────────────────────────────────

/// Heartbeat interval and multiplier `H`
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub heartbeat_interval: Duration,
    pub multiplier: u32,
}

impl LivenessPolicy {
    pub fn new(heartbeat_interval: Duration, multiplier: u32) -> Self {
        Self {
            heartbeat_interval,
            multiplier: multiplier.max(1),
        }
    }

    /// Silence after which an ALIVE node becomes SUSPECT (`H` intervals)
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.multiplier
    }

    /// Silence after which a node becomes DEAD (`2H` intervals)
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * (2 * self.multiplier)
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 3)
    }
}

/// Nodes whose status changed during a sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub suspected: Vec<String>,
    pub dead: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.dead.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

struct NodeEntry {
    descriptor: NodeDescriptor,
    /// When the current status was entered
    status_since: DateTime<Utc>,
}

struct RegistryState {
    nodes: HashMap<String, NodeEntry>,
    version: u64,
}

/// Single-writer registry of known nodes
pub struct PeerRegistry {
    state: Mutex<RegistryState>,
    view_tx: watch::Sender<Arc<ClusterView>>,
    policy: LivenessPolicy,
}

impl PeerRegistry {
    pub fn new(policy: LivenessPolicy) -> Self {
        let (view_tx, _) = watch::channel(Arc::new(ClusterView::default()));
        Self {
            state: Mutex::new(RegistryState {
                nodes: HashMap::new(),
                version: 0,
            }),
            view_tx,
            policy,
        }
    }

    pub fn policy(&self) -> LivenessPolicy {
        self.policy
    }

    /// Insert or refresh a node. Idempotent.
    ///
    /// Returns true if the published view changed.
    pub fn upsert(&self, descriptor: NodeDescriptor) -> bool {
        self.upsert_at(descriptor, Utc::now())
    }

    /// [`upsert`](Self::upsert) with an explicit clock
    pub fn upsert_at(&self, mut descriptor: NodeDescriptor, now: DateTime<Utc>) -> bool {
        descriptor.last_heartbeat = now;
        descriptor.status = NodeStatus::Alive;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let changed = match state.nodes.get_mut(&descriptor.id) {
            None => {
                info!(
                    node_id = %descriptor.id,
                    address = %descriptor.address,
                    free_memory = descriptor.free_memory_bytes,
                    "Node joined"
                );
                state.nodes.insert(
                    descriptor.id.clone(),
                    NodeEntry {
                        descriptor,
                        status_since: now,
                    },
                );
                true
            }
            Some(entry) => {
                let revived = entry.descriptor.status != NodeStatus::Alive;
                let updated = entry.descriptor.attributes_differ(&descriptor);
                if revived {
                    info!(
                        node_id = %descriptor.id,
                        previous = %entry.descriptor.status,
                        "Node is alive again"
                    );
                    entry.status_since = now;
                } else if updated {
                    debug!(node_id = %descriptor.id, "Node attributes changed");
                }
                entry.descriptor = descriptor;
                revived || updated
            }
        };

        if changed {
            self.publish(state);
        }
        changed
    }

    /// Mark a node DEAD immediately
    ///
    /// Returns true if the node was previously in the view.
    pub fn mark_dead(&self, node_id: &str) -> bool {
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.nodes.get_mut(node_id) else {
            return false;
        };
        if entry.descriptor.status == NodeStatus::Dead {
            return false;
        }

        let was_alive = entry.descriptor.status == NodeStatus::Alive;
        entry.descriptor.status = NodeStatus::Dead;
        entry.status_since = now;
        warn!(node_id = %node_id, "Node marked dead");

        if was_alive {
            self.publish(state);
        }
        was_alive
    }

    /// Current view
    pub fn snapshot(&self) -> Arc<ClusterView> {
        self.view_tx.borrow().clone()
    }

    /// Receive every published view
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.view_tx.subscribe()
    }

    /// Apply liveness timeouts
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// [`sweep`](Self::sweep) with an explicit clock
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let suspect_after = self.policy.suspect_after();
        let dead_after = self.policy.dead_after();

        let mut report = SweepReport::default();
        let mut membership_changed = false;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for entry in state.nodes.values_mut() {
            let silence = (now - entry.descriptor.last_heartbeat)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let status = entry.descriptor.status;

            let next = if silence >= dead_after {
                NodeStatus::Dead
            } else if silence >= suspect_after && status == NodeStatus::Alive {
                NodeStatus::Suspect
            } else {
                status
            };

            if next == status {
                continue;
            }

            membership_changed |= status == NodeStatus::Alive;
            entry.descriptor.status = next;
            entry.status_since = now;

            match next {
                NodeStatus::Suspect => {
                    warn!(node_id = %entry.descriptor.id, silence_ms = silence.as_millis() as u64, "Node suspect");
                    report.suspected.push(entry.descriptor.id.clone());
                }
                NodeStatus::Dead => {
                    warn!(node_id = %entry.descriptor.id, silence_ms = silence.as_millis() as u64, "Node dead");
                    report.dead.push(entry.descriptor.id.clone());
                }
                NodeStatus::Alive => {}
            }
        }

        if membership_changed {
            self.publish(state);
        }

        report.suspected.sort();
        report.dead.sort();
        report
    }

    /// Forget nodes that have been DEAD for at least `retention`
    pub fn prune_dead(&self, retention: Duration) -> Vec<String> {
        self.prune_dead_at(retention, Utc::now())
    }

    pub fn prune_dead_at(&self, retention: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.lock();
        let mut pruned: Vec<String> = state
            .nodes
            .values()
            .filter(|e| e.descriptor.status == NodeStatus::Dead)
            .filter(|e| (now - e.status_since).to_std().unwrap_or(Duration::ZERO) >= retention)
            .map(|e| e.descriptor.id.clone())
            .collect();

        for id in &pruned {
            state.nodes.remove(id);
            debug!(node_id = %id, "Pruned dead node");
        }
        pruned.sort();
        pruned
    }

    /// Any known node regardless of status
    pub fn get(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.state.lock().nodes.get(node_id).map(|e| e.descriptor.clone())
    }

    /// All known nodes regardless of status, sorted by id
    pub fn all_nodes(&self) -> Vec<NodeDescriptor> {
        let state = self.state.lock();
        let mut nodes: Vec<NodeDescriptor> =
            state.nodes.values().map(|e| e.descriptor.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Number of known nodes regardless of status
    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build and send a new view. Caller holds the state lock.
    fn publish(&self, state: &mut RegistryState) {
        state.version += 1;
        let mut nodes: Vec<NodeDescriptor> = state
            .nodes
            .values()
            .filter(|e| e.descriptor.status == NodeStatus::Alive)
            .map(|e| e.descriptor.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(version = state.version, nodes = nodes.len(), "Publishing cluster view");
        self.view_tx.send_replace(Arc::new(ClusterView {
            version: state.version,
            nodes,
        }));
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(LivenessPolicy::default())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn node(id: &str, mem_gb: u64) -> NodeDescriptor {
        NodeDescriptor::new(id, format!("{}.local:7420", id), mem_gb * GB, 1.0)
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(LivenessPolicy::new(Duration::from_secs(1), 3))
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_upsert_and_snapshot() {
        let registry = registry();
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.snapshot().version, 0);

        assert!(registry.upsert(node("b", 4)));
        assert!(registry.upsert(node("a", 8)));

        let view = registry.snapshot();
        assert_eq!(view.version, 2);
        let ids: Vec<&str> = view.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(view.total_free_memory(), 12 * GB);
        assert!(view.get("b").is_some());
        assert!(view.get("c").is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let registry = registry();
        registry.upsert(node("a", 8));
        let version = registry.snapshot().version;

        // plain heartbeat does not create a new view
        assert!(!registry.upsert(node("a", 8)));
        assert_eq!(registry.snapshot().version, version);
        assert_eq!(registry.snapshot().len(), 1);

        // capability change does
        assert!(registry.upsert(node("a", 6)));
        assert_eq!(registry.snapshot().version, version + 1);
        assert_eq!(registry.snapshot().nodes[0].free_memory_bytes, 6 * GB);
    }

    #[test]
    fn test_mark_dead_excludes_from_view() {
        let registry = registry();
        registry.upsert(node("a", 8));
        registry.upsert(node("b", 4));

        assert!(registry.mark_dead("b"));
        assert!(!registry.mark_dead("b"));
        assert!(!registry.mark_dead("unknown"));

        let view = registry.snapshot();
        assert_eq!(view.len(), 1);
        assert_eq!(view.nodes[0].id, "a");
        assert_eq!(registry.get("b").unwrap().status, NodeStatus::Dead);
    }

    #[test]
    fn test_sweep_transitions() {
        let registry = registry();
        let t0 = Utc::now();
        registry.upsert_at(node("a", 8), t0);
        registry.upsert_at(node("b", 4), t0);

        // a keeps heartbeating, b goes silent
        registry.upsert_at(node("a", 8), t0 + secs(3));
        let report = registry.sweep_at(t0 + secs(3));
        assert_eq!(report.suspected, vec!["b".to_string()]);
        assert!(report.dead.is_empty());
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.get("b").unwrap().status, NodeStatus::Suspect);

        registry.upsert_at(node("a", 8), t0 + secs(6));
        let report = registry.sweep_at(t0 + secs(6));
        assert_eq!(report.dead, vec!["b".to_string()]);
        assert_eq!(registry.get("b").unwrap().status, NodeStatus::Dead);
    }

    #[test]
    fn test_suspect_to_dead_keeps_version() {
        let registry = registry();
        let t0 = Utc::now();
        registry.upsert_at(node("a", 8), t0);
        registry.sweep_at(t0 + secs(3));
        let after_suspect = registry.snapshot().version;
        registry.sweep_at(t0 + secs(6));
        assert_eq!(registry.snapshot().version, after_suspect);
    }

    #[test]
    fn test_upsert_revives_dead_node() {
        let registry = registry();
        registry.upsert(node("a", 8));
        registry.mark_dead("a");
        assert!(registry.snapshot().is_empty());

        assert!(registry.upsert(node("a", 8)));
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.get("a").unwrap().status, NodeStatus::Alive);
    }

    #[test]
    fn test_prune_dead() {
        let registry = registry();
        let t0 = Utc::now();
        registry.upsert_at(node("a", 8), t0);
        registry.upsert_at(node("b", 8), t0);
        registry.upsert_at(node("a", 8), t0 + secs(6));
        registry.sweep_at(t0 + secs(6));

        assert!(registry.prune_dead_at(Duration::from_secs(10), t0 + secs(10)).is_empty());
        let pruned = registry.prune_dead_at(Duration::from_secs(10), t0 + secs(16));
        assert_eq!(pruned, vec!["b".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sees_new_versions() {
        let registry = registry();
        let mut rx = registry.subscribe();

        registry.upsert(node("a", 8));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().version, 1);

        registry.mark_dead("a");
        rx.changed().await.unwrap();
        let view = rx.borrow_and_update().clone();
        assert_eq!(view.version, 2);
        assert!(view.is_empty());
    }

    #[test]
    fn test_liveness_policy() {
        let policy = LivenessPolicy::new(Duration::from_millis(500), 3);
        assert_eq!(policy.suspect_after(), Duration::from_millis(1500));
        assert_eq!(policy.dead_after(), Duration::from_millis(3000));
    }

    #[test]
    fn test_view_without() {
        let registry = registry();
        registry.upsert(node("a", 8));
        registry.upsert(node("b", 4));
        let view = registry.snapshot().without(&["a".to_string()]);
        assert_eq!(view.len(), 1);
        assert_eq!(view.version, 2);
    }
}
