//! Wire protocol types for coordinator-worker communication.
//!
//! Every control message that crosses the IPC boundary is a [`TaggedMessage`]:
//! a small-integer kind tag, a JSON payload, and an optional correlation
//! token for request/response pairs. Broker traffic travels in a separate
//! [`BrokerEnvelope`] shape distinguished by its channel marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque correlation token tying a response back to its request.
///
/// UUID v4 under the hood so independently generated tokens never collide
/// across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed catalog of control-message kinds.
///
/// Discriminants are part of the wire format and must never be renumbered;
/// new kinds get appended at the end. Serialized as the bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageTag {
    /// Ad-hoc user message, no reply expected.
    Custom = 0,
    /// Ad-hoc user message that expects a correlated reply.
    CustomRequest = 1,
    CustomReply = 2,

    Heartbeat = 3,
    HeartbeatAck = 4,

    /// Send-to-all-workers request issued by one worker.
    BroadcastRequest = 5,
    BroadcastResponse = 6,
    BroadcastResponseError = 7,

    /// Eval on a single worker.
    WorkerEvalRequest = 8,
    WorkerEvalResponse = 9,
    WorkerEvalResponseError = 10,

    /// Eval on the whole cluster, handled by the coordinator.
    ClusterEvalRequest = 11,
    ClusterEvalResponse = 12,
    ClusterEvalResponseError = 13,

    RespawnWorker = 14,
    RespawnAll = 15,

    MaintenanceEnable = 16,
    MaintenanceDisable = 17,
    MaintenanceEnableAll = 18,

    /// Coordinator may start the next staggered worker.
    SpawnNextWorker = 19,
    WorkerReady = 20,
}

impl MessageTag {
    /// Error-carrying member of a response tag family. The correlation layer
    /// uses this to decide between resolving and rejecting a waiter; it does
    /// not interpret tags any further.
    pub fn is_error_response(self) -> bool {
        matches!(
            self,
            Self::BroadcastResponseError
                | Self::WorkerEvalResponseError
                | Self::ClusterEvalResponseError
        )
    }

    /// Any reply-family tag, error variants included.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::CustomReply
                | Self::HeartbeatAck
                | Self::BroadcastResponse
                | Self::WorkerEvalResponse
                | Self::ClusterEvalResponse
        ) || self.is_error_response()
    }
}

impl From<MessageTag> for u8 {
    fn from(tag: MessageTag) -> u8 {
        tag as u8
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message tag {0}")]
pub struct UnknownTag(pub u8);

impl TryFrom<u8> for MessageTag {
    type Error = UnknownTag;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        let tag = match raw {
            0 => Self::Custom,
            1 => Self::CustomRequest,
            2 => Self::CustomReply,
            3 => Self::Heartbeat,
            4 => Self::HeartbeatAck,
            5 => Self::BroadcastRequest,
            6 => Self::BroadcastResponse,
            7 => Self::BroadcastResponseError,
            8 => Self::WorkerEvalRequest,
            9 => Self::WorkerEvalResponse,
            10 => Self::WorkerEvalResponseError,
            11 => Self::ClusterEvalRequest,
            12 => Self::ClusterEvalResponse,
            13 => Self::ClusterEvalResponseError,
            14 => Self::RespawnWorker,
            15 => Self::RespawnAll,
            16 => Self::MaintenanceEnable,
            17 => Self::MaintenanceDisable,
            18 => Self::MaintenanceEnableAll,
            19 => Self::SpawnNextWorker,
            20 => Self::WorkerReady,
            other => return Err(UnknownTag(other)),
        };
        Ok(tag)
    }
}

/// Structured error carried as the `data` of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// One control message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedMessage {
    pub tag: MessageTag,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<CorrelationToken>,
}

impl TaggedMessage {
    /// Fire-and-forget message with no reply expected.
    pub fn new(tag: MessageTag, data: Value) -> Self {
        Self {
            tag,
            data,
            correlation_token: None,
        }
    }

    /// Request stamped with the token the sender registered a waiter under.
    pub fn request(tag: MessageTag, data: Value, token: CorrelationToken) -> Self {
        Self {
            tag,
            data,
            correlation_token: Some(token),
        }
    }

    /// Successful response carrying the request's token back.
    pub fn response(tag: MessageTag, data: Value, token: CorrelationToken) -> Self {
        Self::request(tag, data, token)
    }

    /// Error response; the payload becomes the message `data`.
    pub fn error_response(tag: MessageTag, error: ErrorPayload, token: CorrelationToken) -> Self {
        let data = serde_json::to_value(error).unwrap_or(Value::Null);
        Self::request(tag, data, token)
    }
}

/// Wire field that marks a message as broker traffic rather than control
/// protocol. [`crate::broker::Broker::handle_message`] keys off its presence.
pub const BROKER_CHANNEL_KEY: &str = "brokerChannel";

/// Envelope for one message on a named logical channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEnvelope {
    pub broker_channel: String,
    #[serde(default)]
    pub data: Value,
}
