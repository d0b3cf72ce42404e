//! Type definitions shared across the cluster core
//!
//! Node descriptors, model profiles, and inference requests/results.

mod model;
mod node;
mod request;

pub use model::*;
pub use node::*;
pub use request::*;
