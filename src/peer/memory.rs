//! In-process transport
//!
//! Routes hops straight to per-node engines held in memory. Used for
//! single-process clusters and for exercising the executor and service
//! without sockets: nodes can be taken down and brought back, and every call
//! is counted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::transport::{run_local_batch, run_local_hop, NodeTransport, Probe};
use crate::backend::LayerBackend;
use crate::error::{Error, Result};
use crate::protocol::{HopRequest, HopResponse};
use crate::types::NodeDescriptor;

#[derive(Debug, Default, Clone)]
struct Counters {
    hops: HashMap<String, u32>,
    batches: HashMap<String, u32>,
    pings: u32,
}

/// [`NodeTransport`] over in-memory engines
#[derive(Default)]
pub struct InMemoryTransport {
    nodes: RwLock<HashMap<String, Arc<dyn LayerBackend>>>,
    down: RwLock<HashSet<String>>,
    /// Artificial per-hop delay, applied before the engine runs
    delays: RwLock<HashMap<String, Duration>>,
    counters: RwLock<Counters>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node_id: impl Into<String>, backend: Arc<dyn LayerBackend>) {
        self.nodes.write().insert(node_id.into(), backend);
    }

    /// Make every call to `node_id` fail as unreachable
    pub fn take_down(&self, node_id: &str) {
        self.down.write().insert(node_id.to_string());
    }

    pub fn bring_up(&self, node_id: &str) {
        self.down.write().remove(node_id);
    }

    /// Delay hops to `node_id`
    pub fn set_delay(&self, node_id: &str, delay: Duration) {
        self.delays.write().insert(node_id.to_string(), delay);
    }

    /// Hops delivered to `node_id` (including those in batches)
    pub fn hop_count(&self, node_id: &str) -> u32 {
        self.counters.read().hops.get(node_id).copied().unwrap_or(0)
    }

    /// Batch calls delivered to `node_id`
    pub fn batch_count(&self, node_id: &str) -> u32 {
        self.counters.read().batches.get(node_id).copied().unwrap_or(0)
    }

    pub fn total_hops(&self) -> u32 {
        self.counters.read().hops.values().sum()
    }

    pub fn ping_count(&self) -> u32 {
        self.counters.read().pings
    }

    fn backend_for(&self, node: &NodeDescriptor) -> Result<Arc<dyn LayerBackend>> {
        if self.down.read().contains(&node.id) {
            return Err(Error::connection_failed(&node.address, "node unreachable"));
        }
        self.nodes
            .read()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| Error::connection_failed(&node.address, "unknown node"))
    }

    async fn delay(&self, node: &NodeDescriptor) {
        let delay = self.delays.read().get(&node.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NodeTransport for InMemoryTransport {
    async fn send_hop(&self, node: &NodeDescriptor, request: HopRequest) -> Result<HopResponse> {
        *self.counters.write().hops.entry(node.id.clone()).or_default() += 1;
        let backend = self.backend_for(node)?;
        self.delay(node).await;
        Ok(run_local_hop(backend.as_ref(), request).await)
    }

    async fn send_batch(
        &self,
        node: &NodeDescriptor,
        requests: Vec<HopRequest>,
    ) -> Result<Vec<HopResponse>> {
        {
            let mut counters = self.counters.write();
            *counters.batches.entry(node.id.clone()).or_default() += 1;
            *counters.hops.entry(node.id.clone()).or_default() += requests.len() as u32;
        }
        let backend = self.backend_for(node)?;
        self.delay(node).await;
        Ok(run_local_batch(backend.as_ref(), requests).await)
    }

    async fn ping(&self, node: &NodeDescriptor) -> Result<Probe> {
        self.counters.write().pings += 1;
        self.backend_for(node).map(|_| Probe::local())
    }
}
