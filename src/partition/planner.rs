//! Ring-memory-weighted partitioner
//!
//! Walks the nodes in ring order and gives each a contiguous run of layers
//! sized by its share of the total free memory. Quotas use the largest
//! remainder method; leftover layers go to the largest fractional share,
//! then to the higher compute score, then to the earlier ring position. A
//! node whose quota rounds to zero is dropped and the shares recomputed over
//! the rest. Each run is also capped by the node's free memory; a shortfall
//! carries over to the next node on the ring. If the quota walk cannot place
//! every layer, each rotation of the ring is tried with every node taking as
//! many layers as fit. When layers are too coarse to pack into any node's
//! budget but the cluster as a whole has the memory, the plain proportional
//! split is used without the per-node cap.

use tracing::{debug, warn};

use super::{ring_order, Assignment, Partition};
use crate::error::{Error, Result};
use crate::peer::ClusterView;
use crate::types::{LayerRange, ModelProfile, NodeDescriptor};

/// Pure, deterministic partitioner
#[derive(Debug, Clone, Copy, Default)]
pub struct Partitioner;

impl Partitioner {
    pub fn new() -> Self {
        Self
    }

    /// Partition every layer of `profile` over `view`
    pub fn compute(&self, view: &ClusterView, profile: &ModelProfile) -> Result<Partition> {
        self.compute_range(view, profile, profile.full_range())
    }

    /// Partition layers `[from_layer, total)` over `view`
    pub fn compute_from(
        &self,
        view: &ClusterView,
        profile: &ModelProfile,
        from_layer: u32,
    ) -> Result<Partition> {
        self.compute_range(
            view,
            profile,
            LayerRange::new(from_layer, profile.total_layers()),
        )
    }

    /// Partition an arbitrary sub-range of the model
    pub fn compute_range(
        &self,
        view: &ClusterView,
        profile: &ModelProfile,
        range: LayerRange,
    ) -> Result<Partition> {
        if range.is_empty() || range.end > profile.total_layers() {
            return Err(Error::InvalidPartition(format!(
                "range {} is not inside the {} layers of {}",
                range,
                profile.total_layers(),
                profile.model_id
            )));
        }

        let required = profile.memory_in(range);
        let available = view.total_free_memory();
        if view.is_empty() || available < required {
            return Err(Error::insufficient_capacity(required, available));
        }

        let ring = ring_order(&view.nodes);
        let quotas = layer_quotas(&ring, range.len());

        let assignments = fill_by_quota(&quotas, profile, range)
            .or_else(|| {
                (0..ring.len()).find_map(|offset| {
                    let rotated: Vec<&NodeDescriptor> =
                        ring[offset..].iter().chain(&ring[..offset]).copied().collect();
                    fill_greedy(&rotated, profile, range)
                })
            })
            .unwrap_or_else(|| {
                warn!(
                    model = %profile.model_id,
                    layers = %range,
                    "Layers do not pack into per-node memory; using uncapped proportional split"
                );
                split_by_quota(&quotas, range)
            });

        let partition = Partition {
            model_id: profile.model_id.clone(),
            view_version: view.version,
            total_layers: profile.total_layers(),
            assignments,
        };
        partition.validate_range(range)?;

        debug!(
            model = %profile.model_id,
            version = view.version,
            layers = %range,
            nodes = partition.assignments.len(),
            "Partition computed"
        );
        Ok(partition)
    }
}

/// Per-node layer quotas in ring order, zero-quota nodes removed
fn layer_quotas<'a>(ring: &[&'a NodeDescriptor], layers: u32) -> Vec<(&'a NodeDescriptor, u32)> {
    let mut members: Vec<&NodeDescriptor> = ring
        .iter()
        .copied()
        .filter(|n| n.free_memory_bytes > 0)
        .collect();

    loop {
        if members.is_empty() {
            return Vec::new();
        }
        let total: u128 = members.iter().map(|n| n.free_memory_bytes as u128).sum();
        let mut quotas: Vec<u32> = Vec::with_capacity(members.len());
        let mut remainders: Vec<u128> = Vec::with_capacity(members.len());
        for node in &members {
            let share = layers as u128 * node.free_memory_bytes as u128;
            quotas.push((share / total) as u32);
            remainders.push(share % total);
        }

        let assigned: u32 = quotas.iter().sum();
        let mut order: Vec<usize> = (0..members.len()).collect();
        order.sort_by(|&a, &b| {
            remainders[b]
                .cmp(&remainders[a])
                .then_with(|| members[b].compute_score.total_cmp(&members[a].compute_score))
                .then_with(|| a.cmp(&b))
        });
        for &i in order.iter().take((layers - assigned) as usize) {
            quotas[i] += 1;
        }

        if quotas.iter().all(|&q| q > 0) {
            return members.into_iter().zip(quotas).collect();
        }

        let mut index = 0;
        members.retain(|_| {
            let keep = quotas[index] > 0;
            index += 1;
            keep
        });
    }
}

/// Take up to `quota` (plus any carried shortfall) layers per node,
/// never exceeding its free memory; the last node takes whatever remains.
fn fill_by_quota(
    quotas: &[(&NodeDescriptor, u32)],
    profile: &ModelProfile,
    range: LayerRange,
) -> Option<Vec<Assignment>> {
    let mut assignments = Vec::with_capacity(quotas.len());
    let mut next = range.start;
    let mut carry = 0u32;
    let last = quotas.len().saturating_sub(1);

    for (position, (node, quota)) in quotas.iter().enumerate() {
        if next == range.end {
            break;
        }
        let target = if position == last {
            range.end - next
        } else {
            quota + carry
        };
        let start = next;
        next = take_layers(profile, node.free_memory_bytes, start, range.end, target);
        carry = target - (next - start);

        if next > start {
            assignments.push(Assignment {
                node: (*node).clone(),
                layers: LayerRange::new(start, next),
            });
        }
    }

    (next == range.end).then_some(assignments)
}

/// Exactly `quota` layers per node, ignoring memory budgets
fn split_by_quota(quotas: &[(&NodeDescriptor, u32)], range: LayerRange) -> Vec<Assignment> {
    let mut next = range.start;
    quotas
        .iter()
        .map(|(node, quota)| {
            let start = next;
            next += quota;
            Assignment {
                node: (*node).clone(),
                layers: LayerRange::new(start, next),
            }
        })
        .collect()
}

/// Each node in ring order takes as many layers as its memory allows
fn fill_greedy(
    ring: &[&NodeDescriptor],
    profile: &ModelProfile,
    range: LayerRange,
) -> Option<Vec<Assignment>> {
    let mut assignments = Vec::new();
    let mut next = range.start;

    for node in ring {
        if next == range.end {
            break;
        }
        let start = next;
        next = take_layers(profile, node.free_memory_bytes, start, range.end, u32::MAX);
        if next > start {
            assignments.push(Assignment {
                node: (*node).clone(),
                layers: LayerRange::new(start, next),
            });
        }
    }

    (next == range.end).then_some(assignments)
}

/// End of the longest run from `start` that fits in `budget` and `max_layers`
fn take_layers(profile: &ModelProfile, mut budget: u64, start: u32, end: u32, max_layers: u32) -> u32 {
    let mut next = start;
    while next < end && next - start < max_layers {
        let cost = profile.layers[next as usize].memory_bytes;
        if cost > budget {
            break;
        }
        budget -= cost;
        next += 1;
    }
    next
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LayerCost;

    const GB: u64 = 1024 * 1024 * 1024;

    fn view(nodes: &[(&str, u64, f64)]) -> ClusterView {
        let mut nodes: Vec<NodeDescriptor> = nodes
            .iter()
            .map(|(id, mem, score)| NodeDescriptor::new(*id, format!("{}:7420", id), *mem, *score))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        ClusterView { version: 1, nodes }
    }

    fn layers_for(partition: &Partition, id: &str) -> u32 {
        partition
            .assignments
            .iter()
            .filter(|a| a.node.id == id)
            .map(|a| a.layers.len())
            .sum()
    }

    #[test]
    fn test_memory_weighted_split() {
        // 12GB model over 24 layers on 8GB + 4GB
        let view = view(&[("A", 8 * GB, 1.0), ("B", 4 * GB, 1.0)]);
        let profile = ModelProfile::uniform("m", 24, GB / 2);

        let partition = Partitioner::new().compute(&view, &profile).unwrap();
        partition.validate().unwrap();
        assert_eq!(layers_for(&partition, "A"), 16);
        assert_eq!(layers_for(&partition, "B"), 8);
        assert_eq!(partition.view_version, 1);
    }

    #[test]
    fn test_insufficient_capacity() {
        let view = view(&[("A", 4 * GB, 1.0), ("B", 4 * GB, 1.0)]);
        let profile = ModelProfile::uniform("m", 24, GB / 2);

        match Partitioner::new().compute(&view, &profile) {
            Err(Error::InsufficientCapacity {
                required_bytes,
                available_bytes,
            }) => {
                assert_eq!(required_bytes, 12 * GB);
                assert_eq!(available_bytes, 8 * GB);
            }
            other => panic!("expected InsufficientCapacity, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_view_is_insufficient() {
        let profile = ModelProfile::uniform("m", 4, 1);
        let err = Partitioner::new()
            .compute(&ClusterView::default(), &profile)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_deterministic() {
        let a = view(&[("n1", 3 * GB, 1.0), ("n2", 5 * GB, 2.0), ("n3", 7 * GB, 0.5)]);
        let b = view(&[("n3", 7 * GB, 0.5), ("n1", 3 * GB, 1.0), ("n2", 5 * GB, 2.0)]);
        let profile = ModelProfile::uniform("m", 32, GB / 4);

        let p1 = Partitioner::new().compute(&a, &profile).unwrap();
        let p2 = Partitioner::new().compute(&b, &profile).unwrap();
        assert_eq!(p1.node_ids(), p2.node_ids());
        let r1: Vec<LayerRange> = p1.assignments.iter().map(|a| a.layers).collect();
        let r2: Vec<LayerRange> = p2.assignments.iter().map(|a| a.layers).collect();
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_exact_cover_over_many_shapes() {
        let mems = [1u64, 2, 3, 5, 8, 13];
        for layers in [1u32, 2, 7, 24, 61] {
            for n in 1..=mems.len() {
                let nodes: Vec<(String, u64)> = (0..n)
                    .map(|i| (format!("node-{}", i), mems[i] * GB))
                    .collect();
                let refs: Vec<(&str, u64, f64)> =
                    nodes.iter().map(|(id, m)| (id.as_str(), *m, 1.0)).collect();
                let view = view(&refs);
                let profile = ModelProfile::uniform("m", layers, GB / 64);

                let partition = Partitioner::new().compute(&view, &profile).unwrap();
                partition.validate().unwrap();
                for a in &partition.assignments {
                    assert!(profile.memory_in(a.layers) <= a.node.free_memory_bytes);
                }
            }
        }
    }

    #[test]
    fn test_zero_share_node_excluded() {
        let view = view(&[("big", 1000, 1.0), ("tiny", 1, 1.0)]);
        let profile = ModelProfile::uniform("m", 4, 1);

        let partition = Partitioner::new().compute(&view, &profile).unwrap();
        assert_eq!(partition.node_ids(), vec!["big"]);
        assert_eq!(layers_for(&partition, "big"), 4);
    }

    #[test]
    fn test_tie_goes_to_higher_compute_score() {
        let view = view(&[("slow", 10 * GB, 1.0), ("fast", 10 * GB, 4.0)]);
        let profile = ModelProfile::uniform("m", 3, GB);

        let partition = Partitioner::new().compute(&view, &profile).unwrap();
        assert_eq!(layers_for(&partition, "fast"), 2);
        assert_eq!(layers_for(&partition, "slow"), 1);
    }

    #[test]
    fn test_compute_from_covers_tail() {
        let view = view(&[("A", 8 * GB, 1.0)]);
        let profile = ModelProfile::uniform("m", 24, GB / 2);

        let partition = Partitioner::new().compute_from(&view, &profile, 16).unwrap();
        partition.validate_range(LayerRange::new(16, 24)).unwrap();
        assert_eq!(partition.assignments.len(), 1);
        assert_eq!(partition.assignments[0].layers, LayerRange::new(16, 24));
    }

    #[test]
    fn test_memory_cap_respected_with_uneven_layers() {
        // one heavy layer that only the large node can hold
        let mut profile = ModelProfile::uniform("m", 6, GB);
        profile.layers[5] = LayerCost {
            index: 5,
            memory_bytes: 5 * GB,
            compute_cost: 1.0,
        };
        let view = view(&[("small", 3 * GB, 1.0), ("large", 8 * GB, 1.0)]);

        let partition = Partitioner::new().compute(&view, &profile).unwrap();
        partition.validate().unwrap();
        assert_eq!(partition.node_for_layer(5).unwrap().id, "large");
        for a in &partition.assignments {
            assert!(profile.memory_in(a.layers) <= a.node.free_memory_bytes);
        }
    }

    #[test]
    fn test_coarse_layers_fall_back_to_proportional_split() {
        // 9 GiB fits in 2 x 4.5 GiB overall, but no node holds two 3 GiB layers
        let view = view(&[("A", 9 * GB / 2, 1.0), ("B", 9 * GB / 2, 1.0)]);
        let profile = ModelProfile::uniform("m", 3, 3 * GB);

        let partition = Partitioner::new().compute(&view, &profile).unwrap();
        partition.validate().unwrap();
        assert_eq!(partition.assignments.len(), 2);
        assert_eq!(layers_for(&partition, "A") + layers_for(&partition, "B"), 3);
        assert!(layers_for(&partition, "A") >= 1);
        assert!(layers_for(&partition, "B") >= 1);
    }

    #[test]
    fn test_invalid_range() {
        let view = view(&[("A", 8 * GB, 1.0)]);
        let profile = ModelProfile::uniform("m", 4, 1);
        assert!(matches!(
            Partitioner::new().compute_from(&view, &profile, 4),
            Err(Error::InvalidPartition(_))
        ));
    }
}
