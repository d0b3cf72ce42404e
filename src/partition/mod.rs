//! Layer partitioning
//!
//! Maps the layers of a model onto the ALIVE nodes of a cluster view as an
//! ordered list of contiguous layer ranges.

mod planner;
mod ring;

pub use planner::*;
pub use ring::*;

pub use crate::types::LayerRange;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::NodeDescriptor;

// ─────────────────────────────────────────────────────────────────
// Partition
// ─────────────────────────────────────────────────────────────────

/// One node's share of a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub node: NodeDescriptor,
    pub layers: LayerRange,
}

/// Ordered assignments covering a model's layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub model_id: String,

    /// Cluster view version the partition was computed from
    pub view_version: u64,

    /// Number of layers in the model
    pub total_layers: u32,

    /// Assignments in execution order
    pub assignments: Vec<Assignment>,
}

impl Partition {
    /// Layer range covered by the assignments
    pub fn covered(&self) -> Option<LayerRange> {
        let first = self.assignments.first()?;
        let last = self.assignments.last()?;
        Some(LayerRange::new(first.layers.start, last.layers.end))
    }

    /// Check that the assignments cover `range` contiguously and exactly once
    pub fn validate_range(&self, range: LayerRange) -> Result<()> {
        if range.end > self.total_layers {
            return Err(Error::InvalidPartition(format!(
                "range {} exceeds {} layers",
                range, self.total_layers
            )));
        }
        let mut next = range.start;
        for assignment in &self.assignments {
            if assignment.layers.is_empty() {
                return Err(Error::InvalidPartition(format!(
                    "node {} has an empty range",
                    assignment.node.id
                )));
            }
            if assignment.layers.start != next {
                return Err(Error::InvalidPartition(format!(
                    "expected a range starting at {}, node {} starts at {}",
                    next, assignment.node.id, assignment.layers.start
                )));
            }
            next = assignment.layers.end;
        }
        if next != range.end {
            return Err(Error::InvalidPartition(format!(
                "assignments end at {} instead of {}",
                next, range.end
            )));
        }
        Ok(())
    }

    /// Check the exact cover of `[0, total_layers)`
    pub fn validate(&self) -> Result<()> {
        self.validate_range(LayerRange::new(0, self.total_layers))
    }

    /// Node responsible for `layer`
    pub fn node_for_layer(&self, layer: u32) -> Option<&NodeDescriptor> {
        self.assignments
            .iter()
            .find(|a| a.layers.contains(layer))
            .map(|a| &a.node)
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.assignments.iter().map(|a| a.node.id.as_str()).collect()
    }

    /// Whether any assignment is on `node_id`
    pub fn uses_node(&self, node_id: &str) -> bool {
        self.assignments.iter().any(|a| a.node.id == node_id)
    }

    /// Completed assignments followed by a partition of the remaining layers
    pub fn stitched(completed: Vec<Assignment>, rest: Partition) -> Partition {
        let mut assignments = completed;
        assignments.extend(rest.assignments);
        Partition {
            model_id: rest.model_id,
            view_version: rest.view_version,
            total_layers: rest.total_layers,
            assignments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(id: &str, start: u32, end: u32) -> Assignment {
        Assignment {
            node: NodeDescriptor::new(id, "127.0.0.1:1", 1, 1.0),
            layers: LayerRange::new(start, end),
        }
    }

    fn partition(assignments: Vec<Assignment>) -> Partition {
        Partition {
            model_id: "m".into(),
            view_version: 1,
            total_layers: 24,
            assignments,
        }
    }

    #[test]
    fn test_validate_exact_cover() {
        let p = partition(vec![assignment("a", 0, 16), assignment("b", 16, 24)]);
        assert!(p.validate().is_ok());
        assert_eq!(p.node_for_layer(15).unwrap().id, "a");
        assert_eq!(p.node_for_layer(16).unwrap().id, "b");
        assert_eq!(p.covered(), Some(LayerRange::new(0, 24)));
    }

    #[test]
    fn test_validate_rejects_gap_and_overlap() {
        let gap = partition(vec![assignment("a", 0, 15), assignment("b", 16, 24)]);
        assert!(matches!(gap.validate(), Err(Error::InvalidPartition(_))));

        let overlap = partition(vec![assignment("a", 0, 17), assignment("b", 16, 24)]);
        assert!(overlap.validate().is_err());

        let short = partition(vec![assignment("a", 0, 20)]);
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_stitched_partition() {
        let rest = Partition {
            model_id: "m".into(),
            view_version: 7,
            total_layers: 24,
            assignments: vec![assignment("a", 16, 24)],
        };
        let p = Partition::stitched(vec![assignment("a", 0, 16)], rest);
        assert!(p.validate().is_ok());
        assert_eq!(p.view_version, 7);
        assert_eq!(p.node_ids(), vec!["a", "a"]);
    }
}
