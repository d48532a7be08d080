//! Inbound and outbound message types.

use crate::types::SessionId;
use serde::{Deserialize, Serialize};

/// A normalized inbound message from a channel plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel type identifier.
    pub channel: String,

    /// Conversation ID as known by the channel.
    pub conversation_id: String,

    /// Message text.
    pub text: String,
}

impl InboundMessage {
    /// Create a new inbound message.
    pub fn new(
        channel: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            conversation_id: conversation_id.into(),
            text: text.into(),
        }
    }
}

/// An outbound event emitted by the pipeline for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    /// Session the event belongs to.
    pub session_id: SessionId,

    /// Event payload.
    #[serde(flatten)]
    pub payload: OutboundPayload,
}

impl OutboundEvent {
    /// Create an outbound event for a session.
    pub fn new(session_id: SessionId, payload: OutboundPayload) -> Self {
        Self {
            session_id,
            payload,
        }
    }
}

/// Payload of an outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundPayload {
    /// Incremental assistant text.
    Text { text: String },

    /// The worker invoked a tool.
    ToolCall { tool: String },

    /// The turn failed.
    Error {
        kind: String,
        message: String,
        retryable: bool,
    },

    /// The turn finished.
    Done { status: TurnStatus },
}

/// Final status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// The worker produced a complete response.
    Completed,

    /// The turn was aborted by the user.
    Cancelled,
}
