//! Backend trait definitions

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Activation, LayerRange};

// ─────────────────────────────────────────────────────────────────
// Backend Health & Output
// ─────────────────────────────────────────────────────────────────

/// Health status of a layer engine
#[derive(Debug, Clone)]
pub struct BackendHealth {
    /// Whether the engine accepts work
    pub operational: bool,

    /// Models the engine can run layers of
    pub models: Vec<String>,

    /// Any error message
    pub error: Option<String>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            operational: true,
            models: Vec::new(),
            error: None,
        }
    }
}

/// Result of running a layer range
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOutput {
    /// Activation leaving the last layer of the range
    pub activation: Activation,

    /// Tokens produced, reported only when the range ends the model
    pub tokens_generated: Option<u32>,
}

// ─────────────────────────────────────────────────────────────────
// LayerBackend Trait
// ─────────────────────────────────────────────────────────────────

/// Contract of an external layer engine
///
/// "Run layers `[start, end)` of model M on input X, return activations."
/// Object-safe so nodes can hold `Arc<dyn LayerBackend>`.
#[async_trait]
pub trait LayerBackend: Send + Sync {
    /// Engine name (e.g. "mock", "llama")
    fn name(&self) -> &'static str;

    async fn health_check(&self) -> Result<BackendHealth>;

    /// Whether layers of `model_id` can be executed here
    fn supports_model(&self, model_id: &str) -> bool;

    /// Run one contiguous layer range
    ///
    /// `is_last` is set when the range ends the model, so the engine samples
    /// output instead of returning hidden state.
    async fn run_layers(
        &self,
        model_id: &str,
        layers: LayerRange,
        input: Activation,
        is_last: bool,
    ) -> Result<LayerOutput>;

    /// Run the same range over several inputs
    ///
    /// Engines that batch natively override this; results keep input order.
    async fn run_batch(
        &self,
        model_id: &str,
        layers: LayerRange,
        inputs: Vec<Activation>,
        is_last: bool,
    ) -> Vec<Result<LayerOutput>> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.run_layers(model_id, layers, input, is_last).await);
        }
        outputs
    }
}
