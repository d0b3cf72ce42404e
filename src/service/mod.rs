//! Backend service
//!
//! Request dispatch for the cluster:
//! - Response cache keyed by request fingerprint
//! - Coalescing of identical in-flight requests
//! - First-hop batching at the transport
//! - Start/stop lifecycle around discovery, heartbeat and the hop server

mod backend;
mod batch;
mod cache;
mod coalesce;

pub use backend::*;
pub use batch::BatchingTransport;
pub use cache::{CacheStats, ResponseCache};
pub use coalesce::{Coalescer, RunOutcome};
