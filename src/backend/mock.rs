//! Mock layer engine for testing
//!
//! Appends a `[start..end)` marker to its input for every range it runs, so
//! the final output records exactly which layers were executed and in what
//! order, independent of which node ran them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{Activation, LayerRange};

use super::{BackendHealth, LayerBackend, LayerOutput};

// ─────────────────────────────────────────────────────────────────
// Mock Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for mock engine behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Simulated latency per layer (ms)
    pub layer_latency_ms: u64,

    /// Fail every run
    pub fail_runs: bool,

    /// Fail runs whose range contains this layer
    pub fail_on_layer: Option<u32>,

    /// Tokens reported by the final range
    pub tokens_per_run: u32,

    /// Models served (empty = any)
    pub models: Vec<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            layer_latency_ms: 0,
            fail_runs: false,
            fail_on_layer: None,
            tokens_per_run: 16,
            models: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────

/// Deterministic in-process [`LayerBackend`]
pub struct MockLayerBackend {
    config: MockConfig,
    failing: AtomicBool,
    call_counts: RwLock<CallCounts>,
}

/// Track method call counts for verification
#[derive(Debug, Default)]
struct CallCounts {
    run_layers: u32,
    run_batch: u32,
    batched_inputs: u32,
    health_check: u32,
}

impl MockLayerBackend {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        let failing = AtomicBool::new(config.fail_runs);
        Self {
            config,
            failing,
            call_counts: RwLock::new(CallCounts::default()),
        }
    }

    /// Toggle failure of every subsequent run
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Get the number of times a method was called
    pub fn call_count(&self, method: &str) -> u32 {
        let counts = self.call_counts.read();
        match method {
            "run_layers" => counts.run_layers,
            "run_batch" => counts.run_batch,
            "batched_inputs" => counts.batched_inputs,
            "health_check" => counts.health_check,
            _ => 0,
        }
    }

    pub fn reset_counts(&self) {
        *self.call_counts.write() = CallCounts::default();
    }

    fn check_failure(&self, layers: LayerRange) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("mock failure running {}", layers)));
        }
        if let Some(layer) = self.config.fail_on_layer {
            if layers.contains(layer) {
                return Err(Error::Internal(format!("mock failure at layer {}", layer)));
            }
        }
        Ok(())
    }

    async fn simulate_latency(&self, layers: LayerRange) {
        if self.config.layer_latency_ms > 0 {
            let delay = Duration::from_millis(self.config.layer_latency_ms * layers.len() as u64);
            tokio::time::sleep(delay).await;
        }
    }

    fn execute(&self, layers: LayerRange, mut input: Activation, is_last: bool) -> LayerOutput {
        input.extend_from_slice(format!("[{}..{})", layers.start, layers.end).as_bytes());
        LayerOutput {
            activation: input,
            tokens_generated: is_last.then_some(self.config.tokens_per_run),
        }
    }
}

impl Default for MockLayerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LayerBackend for MockLayerBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        self.call_counts.write().health_check += 1;
        let failing = self.failing.load(Ordering::SeqCst);
        Ok(BackendHealth {
            operational: !failing,
            models: self.config.models.clone(),
            error: failing.then(|| "configured to fail".to_string()),
        })
    }

    fn supports_model(&self, model_id: &str) -> bool {
        self.config.models.is_empty() || self.config.models.iter().any(|m| m == model_id)
    }

    async fn run_layers(
        &self,
        model_id: &str,
        layers: LayerRange,
        input: Activation,
        is_last: bool,
    ) -> Result<LayerOutput> {
        self.call_counts.write().run_layers += 1;

        if !self.supports_model(model_id) {
            return Err(Error::model_not_found(model_id));
        }
        self.check_failure(layers)?;
        self.simulate_latency(layers).await;

        Ok(self.execute(layers, input, is_last))
    }

    async fn run_batch(
        &self,
        model_id: &str,
        layers: LayerRange,
        inputs: Vec<Activation>,
        is_last: bool,
    ) -> Vec<Result<LayerOutput>> {
        {
            let mut counts = self.call_counts.write();
            counts.run_batch += 1;
            counts.batched_inputs += inputs.len() as u32;
        }

        if !self.supports_model(model_id) {
            return inputs
                .iter()
                .map(|_| Err(Error::model_not_found(model_id)))
                .collect();
        }
        if let Err(e) = self.check_failure(layers) {
            let message = e.to_string();
            return inputs
                .iter()
                .map(|_| Err(Error::Internal(message.clone())))
                .collect();
        }

        // One latency charge for the whole batch
        self.simulate_latency(layers).await;
        inputs
            .into_iter()
            .map(|input| Ok(self.execute(layers, input, is_last)))
            .collect()
    }
}
