//! Inference request and result types
//!
//! Requests are identified for caching and coalescing by a fingerprint: a
//! SHA-256 over the model id, the normalized input and the normalized
//! sampling parameters. Request ids and metadata never contribute.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::partition::Partition;
use crate::types::LayerRange;

/// Opaque activation buffer passed between hops
pub type Activation = Vec<u8>;

// ─────────────────────────────────────────────────────────────────
// Sampling Parameters
// ─────────────────────────────────────────────────────────────────

/// Sampling parameters forwarded to the final layers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            top_k: 50,
            max_tokens: 512,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(Error::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidRequest("max_tokens must be at least 1".into()));
        }
        Ok(())
    }

    /// Canonical text form used in fingerprints
    fn normalized(&self) -> String {
        format!(
            "t={};p={};k={};n={}",
            normalize_float(self.temperature),
            normalize_float(self.top_p),
            self.top_k,
            self.max_tokens
        )
    }
}

/// Fixed precision, with -0.0 folded into 0.0
fn normalize_float(value: f32) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{:.6}", value)
}

fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

// ─────────────────────────────────────────────────────────────────
// Fingerprint
// ─────────────────────────────────────────────────────────────────

/// Hex SHA-256 identifying logically identical requests
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────
// Inference Request
// ─────────────────────────────────────────────────────────────────

/// A request as handed to the backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Caller-visible request id (not part of the fingerprint)
    pub request_id: Uuid,

    pub model_id: String,

    /// Prompt text
    pub input: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub sampling: SamplingParams,

    /// Free-form caller metadata (not part of the fingerprint)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// First-hop payload built from a request
#[derive(Debug, Serialize, Deserialize)]
pub struct PromptEnvelope {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub sampling: SamplingParams,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            model_id: model_id.into(),
            input: input.into(),
            system_prompt: None,
            sampling: SamplingParams::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(Error::InvalidRequest("model id is empty".into()));
        }
        self.sampling.validate()
    }

    /// Deterministic fingerprint of this request
    pub fn fingerprint(&self) -> Fingerprint {
        let system = self.system_prompt.as_deref().map(normalize_text).unwrap_or_default();
        let fields = [
            self.model_id.clone(),
            normalize_text(&self.input),
            system,
            self.sampling.normalized(),
        ];

        // Length-prefix each field so boundaries cannot shift between fields
        let mut hasher = Sha256::new();
        hasher.update([self.system_prompt.is_some() as u8]);
        for field in &fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Activation fed to the first hop
    pub fn initial_activation(&self) -> Result<Activation> {
        let envelope = PromptEnvelope {
            input: normalize_text(&self.input),
            system_prompt: self.system_prompt.as_deref().map(normalize_text),
            sampling: self.sampling,
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| Error::Internal(format!("Failed to encode prompt: {}", e)))
    }
}

// ─────────────────────────────────────────────────────────────────
// Inference Result
// ─────────────────────────────────────────────────────────────────

/// How a run finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Every hop succeeded on the first partition
    Completed,
    /// Finished after one or more re-partitions
    Recovered,
}

/// Timing of one hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopLatency {
    pub node_id: String,
    pub layers: LayerRange,
    pub latency_ms: u64,
}

/// Outcome of a successful pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub fingerprint: Fingerprint,

    pub model_id: String,

    /// Output of the last hop
    #[serde(with = "b64")]
    pub output: Activation,

    /// Assignments that actually produced the output
    pub partition: Partition,

    /// Per-hop latency in execution order
    pub hop_latencies: Vec<HopLatency>,

    pub status: CompletionStatus,

    /// Number of re-partitions performed
    pub recoveries: u32,

    /// Tokens generated, if the last hop reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_generated: Option<u32>,

    /// Wall time of the run
    pub processing_time_ms: u64,

    pub completed_at: DateTime<Utc>,
}

impl InferenceResult {
    /// Output interpreted as UTF-8 text
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Sum of per-hop latencies
    pub fn total_hop_latency_ms(&self) -> u64 {
        self.hop_latencies.iter().map(|h| h.latency_ms).sum()
    }
}

/// Serde adapter encoding byte buffers as base64 strings
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = InferenceRequest::new("llama", "Hello world");
        let b = InferenceRequest::new("llama", "Hello world");
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_normalizes_input() {
        let a = InferenceRequest::new("llama", "Hello\r\nworld  ");
        let b = InferenceRequest::new("llama", "  Hello\nworld");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_model_and_sampling() {
        let base = InferenceRequest::new("llama", "hi");
        let other_model = InferenceRequest::new("mistral", "hi");
        let hotter = InferenceRequest::new("llama", "hi").with_sampling(SamplingParams {
            temperature: 1.2,
            ..Default::default()
        });
        let with_system = InferenceRequest::new("llama", "hi").with_system_prompt("be brief");

        assert_ne!(base.fingerprint(), other_model.fingerprint());
        assert_ne!(base.fingerprint(), hotter.fingerprint());
        assert_ne!(base.fingerprint(), with_system.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_metadata_and_negative_zero() {
        let mut a = InferenceRequest::new("m", "x").with_sampling(SamplingParams {
            temperature: -0.0,
            ..Default::default()
        });
        a.metadata.insert("user".into(), "alice".into());
        let b = InferenceRequest::new("m", "x").with_sampling(SamplingParams {
            temperature: 0.0,
            ..Default::default()
        });
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_empty_system_prompt_differs_from_none() {
        let none = InferenceRequest::new("m", "x");
        let empty = InferenceRequest::new("m", "x").with_system_prompt("");
        let blank = InferenceRequest::new("m", "x").with_system_prompt("   ");

        assert_ne!(none.fingerprint(), empty.fingerprint());
        assert_ne!(none.fingerprint(), blank.fingerprint());
        assert_eq!(empty.fingerprint(), blank.fingerprint());
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        let a = InferenceRequest::new("ab", "c");
        let b = InferenceRequest::new("a", "bc");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_sampling_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        let bad = SamplingParams {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = SamplingParams {
            temperature: f32::NAN,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_initial_activation_is_prompt_envelope() {
        let req = InferenceRequest::new("m", " hi ").with_system_prompt("sys");
        let bytes = req.initial_activation().unwrap();
        let envelope: PromptEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope.input, "hi");
        assert_eq!(envelope.system_prompt.as_deref(), Some("sys"));
    }
}
