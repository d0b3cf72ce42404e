//! Error types for the AI4All cluster core
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Pipeline context (last completed layer, failed node) on surfaced errors
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection / transport errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,
    InvalidRequest = 403,

    // Pipeline execution errors (5xx)
    HopFailure = 500,
    HopTimeout = 501,
    RequestTimeout = 502,
    PipelineAborted = 503,
    ServiceStopped = 504,

    // Model errors (6xx)
    ModelNotFound = 600,
    ModelLoadFailed = 601,
    InvalidPartition = 602,

    // Capacity / discovery errors (7xx)
    InsufficientCapacity = 700,
    DiscoveryUnavailable = 701,
    DiscoveryFailed = 702,

    // Internal errors (9xx)
    InternalError = 900,
    NotSupported = 902,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Pipeline errors
            600..=699 => 60, // Model errors
            700..=799 => 70, // Capacity errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutScope {
    /// A single node's hop exceeded the per-hop timeout
    Hop,
    /// The whole pipeline run exceeded the per-request deadline
    Request,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutScope::Hop => write!(f, "hop"),
            TimeoutScope::Request => write!(f, "request"),
        }
    }
}

/// Main error type for the cluster core
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection / Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection to a peer failed
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// Connection timeout
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    /// Generic connection error
    #[error("Connection error: {0}")]
    Connection(String),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Generic protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request failed validation before dispatch
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ─────────────────────────────────────────────────────────────
    // Pipeline Errors
    // ─────────────────────────────────────────────────────────────

    /// A single hop failed (recovered locally by the executor)
    #[error("Hop on node {node_id} starting at layer {layer_start} failed: {message}")]
    HopFailure {
        node_id: String,
        layer_start: u32,
        message: String,
    },

    /// Recovery could not cover the remaining layers
    #[error("Pipeline aborted after layer boundary {last_completed_layer} (failed node: {}): {reason}", .failed_node.as_deref().unwrap_or("none"))]
    PipelineAborted {
        last_completed_layer: u32,
        failed_node: Option<String>,
        reason: String,
    },

    /// Per-hop or per-request deadline expired
    #[error("{scope} timeout after layer boundary {last_completed_layer} (node: {})", .node_id.as_deref().unwrap_or("none"))]
    Timeout {
        scope: TimeoutScope,
        last_completed_layer: u32,
        node_id: Option<String>,
    },

    /// The service is not accepting requests
    #[error("Backend service is stopped")]
    ServiceStopped,

    // ─────────────────────────────────────────────────────────────
    // Model / Partition Errors
    // ─────────────────────────────────────────────────────────────

    /// No profile registered for the model
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    /// Model profile could not be loaded
    #[error("Failed to load model profile {model_id}: {message}")]
    ModelLoadFailed { model_id: String, message: String },

    /// A partition does not form an exact cover
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    // ─────────────────────────────────────────────────────────────
    // Capacity / Discovery Errors
    // ─────────────────────────────────────────────────────────────

    /// Total free memory of ALIVE nodes is below the model's needs
    #[error("Insufficient cluster capacity: need {required_bytes} bytes, have {available_bytes} bytes")]
    InsufficientCapacity {
        required_bytes: u64,
        available_bytes: u64,
    },

    /// No peers were found during the startup grace period
    #[error("No peers discovered within {grace_ms}ms")]
    DiscoveryUnavailable { grace_ms: u64 },

    /// A discovery provider failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::Connection(_) => ErrorCode::ConnectionLost,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::Protocol(_) => ErrorCode::ProtocolUnexpected,
            Error::InvalidRequest(_) => ErrorCode::InvalidRequest,

            Error::HopFailure { .. } => ErrorCode::HopFailure,
            Error::PipelineAborted { .. } => ErrorCode::PipelineAborted,
            Error::Timeout { scope: TimeoutScope::Hop, .. } => ErrorCode::HopTimeout,
            Error::Timeout { scope: TimeoutScope::Request, .. } => ErrorCode::RequestTimeout,
            Error::ServiceStopped => ErrorCode::ServiceStopped,

            Error::ModelNotFound { .. } => ErrorCode::ModelNotFound,
            Error::ModelLoadFailed { .. } => ErrorCode::ModelLoadFailed,
            Error::InvalidPartition(_) => ErrorCode::InvalidPartition,

            Error::InsufficientCapacity { .. } => ErrorCode::InsufficientCapacity,
            Error::DiscoveryUnavailable { .. } => ErrorCode::DiscoveryUnavailable,
            Error::Discovery(_) => ErrorCode::DiscoveryFailed,

            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    ///
    /// Surfaced pipeline errors (aborts, timeouts, capacity) are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::Connection(_)
                | Error::HopFailure { .. }
                | Error::DiscoveryUnavailable { .. }
                | Error::Discovery(_)
                | Error::Io(_)
                | Error::IoRead { .. }
                | Error::IoWrite { .. }
        )
    }

    /// Check if the error is attributable to the remote node
    ///
    /// Local transport shutdown and internal faults are not.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::Connection(_)
                | Error::ProtocolVersion { .. }
                | Error::ProtocolMalformed { .. }
                | Error::Protocol(_)
                | Error::HopFailure { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::ProtocolVersion { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Last completed layer boundary carried by surfaced pipeline errors
    pub fn last_completed_layer(&self) -> Option<u32> {
        match self {
            Error::PipelineAborted { last_completed_layer, .. }
            | Error::Timeout { last_completed_layer, .. } => Some(*last_completed_layer),
            Error::HopFailure { layer_start, .. } => Some(*layer_start),
            _ => None,
        }
    }

    /// Node blamed by a pipeline error, if any
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Error::PipelineAborted { failed_node, .. } => failed_node.as_deref(),
            Error::Timeout { node_id, .. } => node_id.as_deref(),
            Error::HopFailure { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'ai4all-cluster config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'ai4all-cluster config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values. See documentation for valid options."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the peer is running and its listen port is reachable."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The peer may be overloaded or unreachable. Check your firewall settings."
            ),

            Error::ProtocolVersion { .. } => Some(
                "Peers run incompatible versions. Run 'ai4all-cluster version' on each node and upgrade."
            ),

            Error::PipelineAborted { .. } => Some(
                "Not enough live nodes remained to finish the request. Add nodes or retry once the cluster is stable."
            ),
            Error::Timeout { scope: TimeoutScope::Hop, .. } => Some(
                "A node was too slow to answer. Raise 'pipeline.hop_timeout_ms' or check the node's load."
            ),
            Error::Timeout { scope: TimeoutScope::Request, .. } => Some(
                "Raise 'pipeline.request_deadline_ms' or reduce the request size."
            ),

            Error::ModelNotFound { .. } => Some(
                "Register the model's layer profile under [models] in the configuration."
            ),
            Error::ModelLoadFailed { .. } => Some(
                "The model profile file may be malformed. Check that it is valid JSON."
            ),

            Error::InsufficientCapacity { .. } => Some(
                "The live nodes do not have enough free memory for this model. Add nodes or choose a smaller model."
            ),
            Error::DiscoveryUnavailable { .. } => Some(
                "No peers answered yet. Check the discovery mode and that peers share the same network segment."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            addr: addr.into(),
            message: message.into(),
        }
    }

    /// Create a hop failure
    pub fn hop_failure(
        node_id: impl Into<String>,
        layer_start: u32,
        message: impl Into<String>,
    ) -> Self {
        Error::HopFailure {
            node_id: node_id.into(),
            layer_start,
            message: message.into(),
        }
    }

    /// Create a model not found error
    pub fn model_not_found(model_id: impl Into<String>) -> Self {
        Error::ModelNotFound {
            model_id: model_id.into(),
        }
    }

    /// Create an insufficient capacity error
    pub fn insufficient_capacity(required_bytes: u64, available_bytes: u64) -> Self {
        Error::InsufficientCapacity {
            required_bytes,
            available_bytes,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Caller-facing error
// ─────────────────────────────────────────────────────────────────

/// Error shape returned by the backend service.
///
/// Cloneable so that every waiter on a coalesced run receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{code}] {message}")]
pub struct ServiceError {
    /// Machine-readable code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Last layer boundary reached before the failure
    pub last_completed_layer: Option<u32>,

    /// Node blamed for the failure
    pub failed_node: Option<String>,
}

impl ServiceError {
    /// Create a bare service error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            last_completed_layer: None,
            failed_node: None,
        }
    }
}

impl From<&Error> for ServiceError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            last_completed_layer: err.last_completed_layer(),
            failed_node: err.failed_node().map(str::to_string),
        }
    }
}

impl From<Error> for ServiceError {
    fn from(err: Error) -> Self {
        ServiceError::from(&err)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
