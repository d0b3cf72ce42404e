//! Local system probing
//!
//! Detects the memory and compute this node can offer to the cluster.

mod resources;

pub use resources::*;
