//! Node descriptor types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Alive,
    /// Missed heartbeats; excluded from views until heard from again
    Suspect,
    Dead,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "ALIVE"),
            NodeStatus::Suspect => write!(f, "SUSPECT"),
            NodeStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// A node as seen by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier
    pub id: String,

    /// Transport address ("host:port")
    pub address: String,

    /// Free memory available for layers (bytes)
    pub free_memory_bytes: u64,

    /// Relative compute score (higher is faster)
    pub compute_score: f64,

    /// Last time the node was heard from
    pub last_heartbeat: DateTime<Utc>,

    /// Current liveness
    pub status: NodeStatus,
}

impl NodeDescriptor {
    /// A freshly heard-from node
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        free_memory_bytes: u64,
        compute_score: f64,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            free_memory_bytes,
            compute_score,
            last_heartbeat: Utc::now(),
            status: NodeStatus::Alive,
        }
    }

    /// Whether address or capabilities differ from `other`
    pub fn attributes_differ(&self, other: &NodeDescriptor) -> bool {
        self.address != other.address
            || self.free_memory_bytes != other.free_memory_bytes
            || self.compute_score != other.compute_score
    }
}
