//! Pipeline executor
//!
//! Runs a request through the hops of a partition:
//! - Sequential hop dispatch through the node transport
//! - Per-hop and per-request timeouts
//! - Resumable recovery when a node drops mid-run
//! - In-flight run tracking for status and shutdown drain

mod runner;
mod state;

pub use runner::*;
pub use state::*;
