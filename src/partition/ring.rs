//! Stable ring ordering of nodes
//!
//! A node's ring position is derived from a SHA-256 of its id, so the order
//! does not depend on arrival order or on which other nodes are present.

use sha2::{Digest, Sha256};

use crate::types::NodeDescriptor;

/// Ring position of a node id
pub fn ring_position(node_id: &str) -> u64 {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Nodes sorted by ring position (ties by id)
pub fn ring_order(nodes: &[NodeDescriptor]) -> Vec<&NodeDescriptor> {
    let mut ordered: Vec<(u64, &NodeDescriptor)> =
        nodes.iter().map(|n| (ring_position(&n.id), n)).collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    ordered.into_iter().map(|(_, n)| n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeDescriptor> {
        ids.iter()
            .map(|id| NodeDescriptor::new(*id, "127.0.0.1:1", 1, 1.0))
            .collect()
    }

    #[test]
    fn test_ring_position_is_stable() {
        assert_eq!(ring_position("node-a"), ring_position("node-a"));
        assert_ne!(ring_position("node-a"), ring_position("node-b"));
    }

    #[test]
    fn test_ring_order_ignores_input_order() {
        let forward = nodes(&["a", "b", "c", "d"]);
        let reverse = nodes(&["d", "c", "b", "a"]);

        let f: Vec<&str> = ring_order(&forward).iter().map(|n| n.id.as_str()).collect();
        let r: Vec<&str> = ring_order(&reverse).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(f, r);
    }

    #[test]
    fn test_ring_order_unaffected_by_other_members() {
        let all = nodes(&["a", "b", "c"]);
        let some = nodes(&["a", "c"]);

        let full: Vec<&str> = ring_order(&all)
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| *id != "b")
            .collect();
        let partial: Vec<&str> = ring_order(&some).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(full, partial);
    }
}
