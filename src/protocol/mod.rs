//! Node-to-node wire protocol
//!
//! Hop execution, batched hops, liveness probes and presence announcements.
//! Messages are JSON envelopes with a type discriminator and a protocol
//! version; TCP frames them with a length prefix, UDP sends one per datagram.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
