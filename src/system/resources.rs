//! Local resource probe
//!
//! Feeds the node's own announcement: free memory from the OS, a compute
//! score from the core count, and the hostname used for default node ids.

use serde::{Deserialize, Serialize};

use crate::config::NodeSettings;

/// Fallback when the OS does not report available memory
const DEFAULT_FREE_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Resources this node can contribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResources {
    /// Memory available for model layers (bytes)
    pub free_memory_bytes: u64,

    /// Relative compute score
    pub compute_score: f64,

    pub cpu_count: usize,

    pub hostname: String,
}

impl LocalResources {
    /// Probe the running system
    pub fn probe() -> Self {
        let cpu_count = num_cpus::get();
        Self {
            free_memory_bytes: available_memory_bytes().unwrap_or(DEFAULT_FREE_MEMORY_BYTES),
            compute_score: compute_score(cpu_count, num_cpus::get_physical()),
            cpu_count,
            hostname: local_hostname(),
        }
    }

    /// Probe, then apply operator overrides from `[node]`
    pub fn probe_with(settings: &NodeSettings) -> Self {
        Self::probe().with_overrides(settings)
    }

    pub fn with_overrides(mut self, settings: &NodeSettings) -> Self {
        if let Some(bytes) = settings.free_memory_bytes {
            self.free_memory_bytes = bytes;
        }
        if let Some(score) = settings.compute_score {
            self.compute_score = score;
        }
        self
    }
}

/// Physical cores count fully, extra logical cores count half
fn compute_score(logical: usize, physical: usize) -> f64 {
    let physical = physical.min(logical).max(1);
    physical as f64 + (logical.saturating_sub(physical)) as f64 * 0.5
}

/// Available memory in bytes
#[cfg(target_os = "linux")]
fn available_memory_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_available(&content)
}

#[cfg(not(target_os = "linux"))]
fn available_memory_bytes() -> Option<u64> {
    None
}

/// `MemAvailable` from /proc/meminfo contents, in bytes
fn parse_meminfo_available(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_meminfo_available(content), Some(8_192_000 * 1024));
        assert_eq!(parse_meminfo_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_compute_score() {
        assert_eq!(compute_score(8, 4), 6.0);
        assert_eq!(compute_score(4, 4), 4.0);
        // A zero physical count still yields a usable score
        assert_eq!(compute_score(1, 0), 1.0);
    }

    #[test]
    fn test_probe_reports_something() {
        let res = LocalResources::probe();
        assert!(res.cpu_count >= 1);
        assert!(res.free_memory_bytes > 0);
        assert!(res.compute_score > 0.0);
    }

    #[test]
    fn test_overrides_win() {
        let settings = NodeSettings {
            free_memory_bytes: Some(123),
            compute_score: Some(9.5),
            ..NodeSettings::default()
        };
        let res = LocalResources::probe().with_overrides(&settings);
        assert_eq!(res.free_memory_bytes, 123);
        assert_eq!(res.compute_score, 9.5);
    }
}
