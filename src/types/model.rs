//! Model profile types
//!
//! A model profile lists per-layer memory and compute cost. Profiles are
//! read-only once loaded and shared behind an `Arc`.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Layer Range
// ─────────────────────────────────────────────────────────────────

/// Half-open range of layer indices `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Number of layers in the range
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, layer: u32) -> bool {
        layer >= self.start && layer < self.end
    }
}

impl fmt::Display for LayerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ─────────────────────────────────────────────────────────────────
// Model Profile
// ─────────────────────────────────────────────────────────────────

/// Cost of a single layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCost {
    /// Layer index (0-based, contiguous)
    pub index: u32,

    /// Memory needed to hold the layer (bytes)
    pub memory_bytes: u64,

    /// Relative compute cost
    #[serde(default = "default_compute_cost")]
    pub compute_cost: f64,
}

fn default_compute_cost() -> f64 {
    1.0
}

/// Per-layer cost table for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Model identifier used in requests
    pub model_id: String,

    /// Layers ordered by index
    pub layers: Vec<LayerCost>,
}

impl ModelProfile {
    /// Build a profile where every layer has the same cost
    pub fn uniform(model_id: impl Into<String>, layers: u32, memory_per_layer: u64) -> Self {
        Self {
            model_id: model_id.into(),
            layers: (0..layers)
                .map(|index| LayerCost {
                    index,
                    memory_bytes: memory_per_layer,
                    compute_cost: 1.0,
                })
                .collect(),
        }
    }

    pub fn total_layers(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Total memory of all layers (bytes)
    pub fn total_memory(&self) -> u64 {
        self.layers.iter().map(|l| l.memory_bytes).sum()
    }

    /// Memory of the layers in `range` (bytes)
    pub fn memory_in(&self, range: LayerRange) -> u64 {
        self.layers
            .iter()
            .filter(|l| range.contains(l.index))
            .map(|l| l.memory_bytes)
            .sum()
    }

    /// The full layer range of the model
    pub fn full_range(&self) -> LayerRange {
        LayerRange::new(0, self.total_layers())
    }

    /// Check that layers are non-empty and indexed `0..n` in order
    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(Error::ModelLoadFailed {
                model_id: String::new(),
                message: "model_id is empty".to_string(),
            });
        }
        if self.layers.is_empty() {
            return Err(Error::ModelLoadFailed {
                model_id: self.model_id.clone(),
                message: "profile has no layers".to_string(),
            });
        }
        for (expected, layer) in self.layers.iter().enumerate() {
            if layer.index as usize != expected {
                return Err(Error::ModelLoadFailed {
                    model_id: self.model_id.clone(),
                    message: format!(
                        "layer indices must be contiguous from 0: found {} at position {}",
                        layer.index, expected
                    ),
                });
            }
            if !layer.compute_cost.is_finite() || layer.compute_cost < 0.0 {
                return Err(Error::ModelLoadFailed {
                    model_id: self.model_id.clone(),
                    message: format!("layer {} has an invalid compute cost", layer.index),
                });
            }
        }
        Ok(())
    }

    /// Load and validate a profile from a JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let profile: ModelProfile =
            serde_json::from_str(&content).map_err(|e| Error::ModelLoadFailed {
                model_id: path.display().to_string(),
                message: e.to_string(),
            })?;
        profile.validate()?;
        Ok(profile)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_layer_range() {
        let r = LayerRange::new(16, 24);
        assert_eq!(r.len(), 8);
        assert!(r.contains(16));
        assert!(!r.contains(24));
        assert_eq!(r.to_string(), "[16, 24)");
        assert!(LayerRange::new(3, 3).is_empty());
    }

    #[test]
    fn test_uniform_profile_totals() {
        let profile = ModelProfile::uniform("llama-12g", 24, GB / 2);
        assert_eq!(profile.total_layers(), 24);
        assert_eq!(profile.total_memory(), 12 * GB);
        assert_eq!(profile.memory_in(LayerRange::new(16, 24)), 4 * GB);
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_gaps() {
        let mut profile = ModelProfile::uniform("m", 4, 10);
        profile.layers[2].index = 5;
        assert!(profile.validate().is_err());

        let empty = ModelProfile {
            model_id: "m".into(),
            layers: vec![],
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.json");
        std::fs::write(
            &path,
            r#"{"model_id":"tiny","layers":[
                {"index":0,"memory_bytes":100},
                {"index":1,"memory_bytes":200,"compute_cost":2.5}
            ]}"#,
        )
        .unwrap();

        let profile = ModelProfile::load_from_file(&path).unwrap();
        assert_eq!(profile.model_id, "tiny");
        assert_eq!(profile.total_memory(), 300);
        assert_eq!(profile.layers[0].compute_cost, 1.0);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ModelProfile::load_from_file(Path::new("/nonexistent/profile.json")).unwrap_err();
        assert!(matches!(err, Error::IoRead { .. }));
    }
}
