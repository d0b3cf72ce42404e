//! AI4All cluster core
//!
//! Coordinates a set of heterogeneous nodes that together serve one model:
//! peers are discovered and tracked in a registry, the model's layers are
//! partitioned over a stable ring of the ALIVE nodes, and requests flow
//! through the nodes as a pipeline of hops that recovers when a node drops.

pub mod backend;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod logging;
pub mod partition;
pub mod peer;
pub mod protocol;
pub mod service;
pub mod system;
pub mod types;
pub mod version;

pub use error::{Error, ErrorCode, Result, ServiceError};
