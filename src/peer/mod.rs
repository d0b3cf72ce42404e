//! Peer membership and node-to-node transport
//!
//! The registry tracks which nodes exist and whether they are alive; the
//! transport carries hop activations to them. Nodes talk to each other over
//! direct TCP connections with length-prefixed JSON frames.

pub mod frame;
pub mod memory;
pub mod registry;
pub mod server;
pub mod transport;

pub use memory::*;
pub use registry::*;
pub use server::*;
pub use transport::*;
