//! Layer execution engines
//!
//! A node executes contiguous slices of a model through a [`LayerBackend`].
//! The numeric engines live outside this crate; [`MockLayerBackend`] is a
//! deterministic engine for tests and single-machine runs.

mod mock;
mod traits;

pub use mock::{MockConfig, MockLayerBackend};
pub use traits::*;
