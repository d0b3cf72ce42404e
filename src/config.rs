//! Configuration system for the AI4All cluster node
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (AI4ALL_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main cluster node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Local node identity and participation
    pub node: NodeSettings,

    /// Peer discovery settings
    pub discovery: DiscoverySettings,

    /// Pipeline execution limits
    pub pipeline: PipelineSettings,

    /// Response cache settings
    pub cache: CacheSettings,

    /// Backend service settings (batching, shutdown)
    pub service: ServiceSettings,

    /// Node transport settings
    pub transport: TransportSettings,

    /// Model layer profiles
    pub models: ModelSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Local node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Unique node identifier (derived from the hostname if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable node name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// TCP listen port for hop requests
    pub listen_port: u16,

    /// Whether this node executes layers itself
    pub participate: bool,

    /// Address announced to peers (auto-detected if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,

    /// Override for the probed free memory (bytes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_memory_bytes: Option<u64>,

    /// Override for the probed compute score
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_score: Option<f64>,
}

/// How peers are found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// UDP presence announcements on the local segment
    Broadcast,
    /// External directory API
    Overlay,
    /// Static peer list with health probes
    Manual,
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMode::Broadcast => write!(f, "broadcast"),
            DiscoveryMode::Overlay => write!(f, "overlay"),
            DiscoveryMode::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for DiscoveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "broadcast" => Ok(DiscoveryMode::Broadcast),
            "overlay" => Ok(DiscoveryMode::Overlay),
            "manual" => Ok(DiscoveryMode::Manual),
            other => Err(Error::config_field_invalid(
                "discovery.mode",
                format!("Unknown discovery mode '{}'", other),
            )),
        }
    }
}

/// A statically configured peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Node identifier
    pub id: String,

    /// Host name or IP address
    pub address: String,

    /// Transport port
    pub port: u16,

    /// Free memory assumed until the peer reports its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_memory_bytes: Option<u64>,

    /// Compute score assumed until the peer reports its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_score: Option<f64>,
}

impl PeerEntry {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            free_memory_bytes: None,
            compute_score: None,
        }
    }

    /// "address:port" form used by the transport
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Discovery mode
    pub mode: DiscoveryMode,

    /// Heartbeat / announcement interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Missed intervals before a node is SUSPECT (DEAD after twice as many)
    pub liveness_multiplier: u32,

    /// Time to wait for the first peer before reporting discovery unavailable
    pub startup_grace_ms: u64,

    /// UDP port for presence announcements
    pub broadcast_port: u16,

    /// Destination address for presence announcements
    pub broadcast_addr: String,

    /// Overlay directory base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_url: Option<String>,

    /// Overlay directory API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_api_key: Option<String>,

    /// Overlay poll interval in milliseconds
    pub overlay_poll_interval_ms: u64,

    /// Static peers (manual mode)
    pub peers: Vec<PeerEntry>,
}

/// Pipeline execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Timeout for a single hop in milliseconds
    pub hop_timeout_ms: u64,

    /// Deadline for a whole request in milliseconds
    pub request_deadline_ms: u64,

    /// Maximum re-partitions per request
    pub max_recoveries: u32,
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entry lifetime in seconds
    pub ttl_secs: u64,

    /// Maximum number of cached responses
    pub max_entries: usize,
}

/// Backend service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Maximum concurrent first-hop batches
    pub max_in_flight_batches: usize,

    /// Time to collect first-hop calls into one batch (0 = no batching)
    pub batch_window_ms: u64,

    /// Maximum calls per batch
    pub max_batch_size: usize,

    /// Upper bound on draining in-flight runs at shutdown
    pub shutdown_grace_ms: u64,
}

/// Node transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Maximum frame size in bytes
    pub max_message_bytes: u32,
}

/// Model profile settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Paths to model profile JSON files
    pub profiles: Vec<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            listen_port: 7420,
            participate: true,
            advertise_addr: None,
            free_memory_bytes: None,
            compute_score: None,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Broadcast,
            heartbeat_interval_ms: 2000,
            liveness_multiplier: 3,
            startup_grace_ms: 10_000,
            broadcast_port: 7421,
            broadcast_addr: "255.255.255.255".to_string(),
            overlay_url: None,
            overlay_api_key: None,
            overlay_poll_interval_ms: 5000,
            peers: vec![],
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            hop_timeout_ms: 30_000,
            request_deadline_ms: 300_000,
            max_recoveries: 3,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1024,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_in_flight_batches: 4,
            batch_window_ms: 5,
            max_batch_size: 8,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            max_message_bytes: crate::peer::frame::DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl DiscoverySettings {
    /// Heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Startup grace period as a Duration
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Overlay poll interval as a Duration
    pub fn overlay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.overlay_poll_interval_ms)
    }
}

impl PipelineSettings {
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl ServiceSettings {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClusterConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: e.to_string(),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::config_not_found(path));
            }
        }

        let search_paths = [
            PathBuf::from("ai4all-cluster.toml"),
            dirs::config_dir()
                .map(|p| p.join("ai4all").join("cluster.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".ai4all").join("cluster.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ai4all/cluster.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("AI4ALL_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Ok(val) = std::env::var("AI4ALL_NODE_NAME") {
            self.node.name = Some(val);
        }
        if let Some(n) = env_parse("AI4ALL_LISTEN_PORT") {
            self.node.listen_port = n;
        }
        if let Some(b) = env_bool("AI4ALL_PARTICIPATE") {
            self.node.participate = b;
        }
        if let Ok(val) = std::env::var("AI4ALL_ADVERTISE_ADDR") {
            self.node.advertise_addr = Some(val);
        }
        if let Some(n) = env_parse("AI4ALL_FREE_MEMORY_BYTES") {
            self.node.free_memory_bytes = Some(n);
        }

        // Discovery settings
        if let Some(mode) = env_parse("AI4ALL_DISCOVERY_MODE") {
            self.discovery.mode = mode;
        }
        if let Some(n) = env_parse("AI4ALL_HEARTBEAT_INTERVAL_MS") {
            self.discovery.heartbeat_interval_ms = n;
        }
        if let Some(n) = env_parse("AI4ALL_LIVENESS_MULTIPLIER") {
            self.discovery.liveness_multiplier = n;
        }
        if let Some(n) = env_parse("AI4ALL_BROADCAST_PORT") {
            self.discovery.broadcast_port = n;
        }
        if let Ok(val) = std::env::var("AI4ALL_OVERLAY_URL") {
            self.discovery.overlay_url = Some(val);
        }
        if let Ok(val) = std::env::var("AI4ALL_OVERLAY_API_KEY") {
            self.discovery.overlay_api_key = Some(val);
        }

        // Pipeline settings
        if let Some(n) = env_parse("AI4ALL_HOP_TIMEOUT_MS") {
            self.pipeline.hop_timeout_ms = n;
        }
        if let Some(n) = env_parse("AI4ALL_REQUEST_DEADLINE_MS") {
            self.pipeline.request_deadline_ms = n;
        }

        // Cache settings
        if let Some(n) = env_parse("AI4ALL_CACHE_TTL_SECS") {
            self.cache.ttl_secs = n;
        }
        if let Some(n) = env_parse("AI4ALL_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = n;
        }

        // Service settings
        if let Some(n) = env_parse("AI4ALL_MAX_IN_FLIGHT_BATCHES") {
            self.service.max_in_flight_batches = n;
        }

        // Logging settings
        if let Ok(val) = std::env::var("AI4ALL_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("AI4ALL_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(b) = env_bool("AI4ALL_LOG_JSON") {
            self.logging.json_format = b;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.models.profiles = self.models.profiles.iter().map(|p| expand_path(p)).collect();

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.discovery.heartbeat_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "discovery.heartbeat_interval_ms",
                "heartbeat_interval_ms must be greater than 0",
            ));
        }
        if self.discovery.liveness_multiplier == 0 {
            return Err(Error::config_field_invalid(
                "discovery.liveness_multiplier",
                "liveness_multiplier must be at least 1",
            ));
        }

        match self.discovery.mode {
            DiscoveryMode::Overlay => {
                let raw = self.discovery.overlay_url.as_deref().ok_or_else(|| {
                    Error::config_field_invalid(
                        "discovery.overlay_url",
                        "overlay discovery requires overlay_url",
                    )
                })?;
                let parsed = url::Url::parse(raw).map_err(|e| {
                    Error::config_field_invalid(
                        "discovery.overlay_url",
                        format!("Invalid overlay_url '{}': {}", raw, e),
                    )
                })?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(Error::config_field_invalid(
                        "discovery.overlay_url",
                        "overlay_url must start with http:// or https://",
                    ));
                }
            }
            DiscoveryMode::Manual => {
                let mut seen = HashSet::new();
                for peer in &self.discovery.peers {
                    if peer.id.is_empty() || peer.address.is_empty() || peer.port == 0 {
                        return Err(Error::config_field_invalid(
                            "discovery.peers",
                            format!("Peer entry '{}' needs id, address and a non-zero port", peer.id),
                        ));
                    }
                    if !seen.insert(peer.id.as_str()) {
                        return Err(Error::config_field_invalid(
                            "discovery.peers",
                            format!("Duplicate peer id '{}'", peer.id),
                        ));
                    }
                }
            }
            DiscoveryMode::Broadcast => {
                if self.discovery.broadcast_port == 0 {
                    return Err(Error::config_field_invalid(
                        "discovery.broadcast_port",
                        "broadcast_port must be non-zero",
                    ));
                }
            }
        }

        if self.pipeline.hop_timeout_ms == 0 || self.pipeline.request_deadline_ms == 0 {
            return Err(Error::config_validation(
                "hop_timeout_ms and request_deadline_ms must be greater than 0",
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::config_field_invalid(
                "cache.max_entries",
                "max_entries must be greater than 0",
            ));
        }
        if self.service.max_in_flight_batches == 0 || self.service.max_batch_size == 0 {
            return Err(Error::config_validation(
                "max_in_flight_batches and max_batch_size must be at least 1",
            ));
        }

        if self.transport.max_message_bytes < 1024 {
            return Err(Error::config_field_invalid(
                "transport.max_message_bytes",
                "max_message_bytes must be at least 1024",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Local node id, falling back to "<hostname>-<port>"
    pub fn node_id(&self) -> String {
        self.node.id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "node".to_string());
            format!("{}-{}", host, self.node.listen_port)
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ai4all")
                .join("cluster.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# AI4All Cluster Node Configuration
# https://github.com/ai4all/cluster

[node]
# Unique node identifier (defaults to "<hostname>-<listen_port>")
# id = "node-a"

# Human-readable node name
# name = "Living room desktop"

# TCP port that serves hop requests from peers
listen_port = 7420

# Execute model layers on this node
participate = true

# Address announced to peers (auto-detected if not set)
# advertise_addr = "192.168.1.20"

# Override probed free memory / compute score
# free_memory_bytes = 8589934592
# compute_score = 1.0

[discovery]
# Discovery mode: broadcast, overlay, manual
mode = "broadcast"

# Heartbeat / announcement interval in milliseconds
heartbeat_interval_ms = 2000

# Missed heartbeats before SUSPECT (DEAD after twice as many)
liveness_multiplier = 3

# Warn if no peer is seen within this window (milliseconds)
startup_grace_ms = 10000

# UDP announcement port and destination
broadcast_port = 7421
broadcast_addr = "255.255.255.255"

# Overlay directory (mode = "overlay")
# overlay_url = "https://directory.example.net"
# overlay_api_key = ""
overlay_poll_interval_ms = 5000

# Static peers (mode = "manual")
# [[discovery.peers]]
# id = "node-b"
# address = "192.168.1.21"
# port = 7420
# free_memory_bytes = 8589934592   # used until the peer answers a probe

[pipeline]
# Timeout for one node's hop (milliseconds)
hop_timeout_ms = 30000

# Deadline for a whole request (milliseconds)
request_deadline_ms = 300000

# Maximum re-partitions after node failures per request
max_recoveries = 3

[cache]
# Cached response lifetime in seconds
ttl_secs = 300

# Maximum number of cached responses
max_entries = 1024

[service]
# Maximum concurrent first-hop batches
max_in_flight_batches = 4

# Window for grouping first-hop calls (0 = no batching)
batch_window_ms = 5

# Maximum calls per batch
max_batch_size = 8

# Upper bound for draining in-flight requests at shutdown
shutdown_grace_ms = 10000

[transport]
# TCP connect timeout in milliseconds
connect_timeout_ms = 5000

# Maximum frame size in bytes
max_message_bytes = 67108864

[models]
# Model layer profiles (JSON)
profiles = []

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.ai4all/cluster/logs/cluster.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
