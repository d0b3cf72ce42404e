//! Protocol message definitions
//!
//! Messages are serialized as JSON with a type discriminator, wrapped in an
//! envelope carrying the sender's protocol version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::error::{Error, ErrorCode};
use crate::types::{b64, Activation, Fingerprint, LayerRange, NodeDescriptor};

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    /// Sender's protocol version
    pub version: ProtocolVersion,

    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    pub fn new(payload: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            payload,
        }
    }

    /// Reply envelope reusing the request id
    pub fn reply(&self, payload: Message) -> Self {
        Self {
            id: self.id,
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Pipeline ───────────────────────────────────────────────
    /// Run a layer range on the receiving node
    Hop(HopRequest),

    /// Result of a single hop
    HopResult(HopResponse),

    /// Several first hops sharing node, model and range
    HopBatch(HopBatchRequest),

    /// Results of a batch, in request order
    HopBatchResult(HopBatchResponse),

    // ─── Liveness / Discovery ───────────────────────────────────
    Ping { seq: u64 },

    Pong {
        seq: u64,
        node_id: String,
        /// Responder's current announcement, when it knows itself
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<Announcement>,
    },

    /// Presence announcement
    Announce(Announcement),

    /// Request-level failure (malformed frame, version mismatch)
    Error(ErrorMessage),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hop(_) => "HOP",
            Message::HopResult(_) => "HOP_RESULT",
            Message::HopBatch(_) => "HOP_BATCH",
            Message::HopBatchResult(_) => "HOP_BATCH_RESULT",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Announce(_) => "ANNOUNCE",
            Message::Error(_) => "ERROR",
        }
    }

    /// Check if this message expects a reply
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Hop(_) | Message::HopBatch(_) | Message::Ping { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Hop Messages
// ─────────────────────────────────────────────────────────────────

/// One node's share of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRequest {
    pub model_id: String,

    /// Layers to execute on the receiving node
    pub layers: LayerRange,

    /// Activation entering `layers.start`
    #[serde(with = "b64")]
    pub input: Activation,

    pub fingerprint: Fingerprint,

    /// Position of this hop in the run (0 = first hop)
    pub hop_index: u32,

    /// Whether the receiving node runs the final layers
    #[serde(default)]
    pub is_last: bool,
}

/// Outcome reported by the executing node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopStatus {
    Ok,
    Failed,
}

/// Result of a hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopResponse {
    /// Activation leaving `layers.end`
    #[serde(with = "b64")]
    pub output: Activation,

    /// Time spent executing on the node
    pub latency_ms: u64,

    pub status: HopStatus,

    /// Tokens produced, reported by the final hop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_generated: Option<u32>,

    /// Failure description when `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HopResponse {
    pub fn ok(output: Activation, latency_ms: u64, tokens_generated: Option<u32>) -> Self {
        Self {
            output,
            latency_ms,
            status: HopStatus::Ok,
            tokens_generated,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            output: Vec::new(),
            latency_ms,
            status: HopStatus::Failed,
            tokens_generated: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HopStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopBatchRequest {
    pub requests: Vec<HopRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopBatchResponse {
    pub responses: Vec<HopResponse>,
}

// ─────────────────────────────────────────────────────────────────
// Discovery Messages
// ─────────────────────────────────────────────────────────────────

/// Presence announcement emitted on heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: String,

    /// Transport address peers should dial ("host:port")
    pub address: String,

    pub free_memory_bytes: u64,

    pub compute_score: f64,

    pub timestamp: DateTime<Utc>,
}

impl Announcement {
    pub fn from_descriptor(node: &NodeDescriptor) -> Self {
        Self {
            node_id: node.id.clone(),
            address: node.address.clone(),
            free_memory_bytes: node.free_memory_bytes,
            compute_score: node.compute_score,
            timestamp: Utc::now(),
        }
    }

    /// Descriptor to upsert on receipt
    ///
    /// The heartbeat is stamped by the registry on upsert, so a skewed sender
    /// clock cannot age a node out early.
    pub fn to_descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new(
            self.node_id.clone(),
            self.address.clone(),
            self.free_memory_bytes,
            self.compute_score,
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&Error> for ErrorMessage {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InferenceRequest;

    fn hop() -> HopRequest {
        let request = InferenceRequest::new("llama", "hello");
        HopRequest {
            model_id: "llama".into(),
            layers: LayerRange::new(0, 16),
            input: vec![0, 1, 2, 254, 255],
            fingerprint: request.fingerprint(),
            hop_index: 0,
            is_last: false,
        }
    }

    #[test]
    fn test_hop_envelope_serialization() {
        let envelope = MessageEnvelope::new(Message::Hop(hop()));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"HOP\""));
        assert!(json.contains("\"version\""));
        // Activations travel as base64 text
        assert!(json.contains("AAEC/v8="));

        let parsed: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, envelope.id);
        match parsed.payload {
            Message::Hop(h) => assert_eq!(h, hop()),
            other => panic!("expected HOP, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_ping_pong_shape() {
        let ping = MessageEnvelope::new(Message::Ping { seq: 7 });
        let pong = ping.reply(Message::Pong {
            seq: 7,
            node_id: "a".into(),
            node: None,
        });
        assert_eq!(ping.id, pong.id);
        assert!(ping.payload.is_request());
        assert!(!pong.payload.is_request());

        let json = serde_json::to_string(&pong).unwrap();
        assert!(json.contains("\"type\":\"PONG\""));
    }

    #[test]
    fn test_failed_response_omits_output_fields() {
        let resp = HopResponse::failed("out of memory", 3);
        assert!(!resp.is_ok());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(!json.contains("tokens_generated"));
    }

    #[test]
    fn test_announcement_to_descriptor() {
        let node = NodeDescriptor::new("a", "10.0.0.1:7420", 8 << 30, 2.5);
        let ann = Announcement::from_descriptor(&node);
        let back = ann.to_descriptor();
        assert_eq!(back.id, "a");
        assert_eq!(back.address, "10.0.0.1:7420");
        assert!(!back.attributes_differ(&node));
    }

    #[test]
    fn test_error_message_from_error() {
        let err = Error::model_not_found("llama");
        let msg = ErrorMessage::from(&err);
        assert_eq!(msg.code, ErrorCode::ModelNotFound);
        assert!(msg.message.contains("llama"));
    }
}
