//! WebSocket wire frames.
//!
//! Clients send request frames and receive a correlated response frame per
//! request, plus uncorrelated event frames for sessions they subscribe to.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};

/// One JSON frame on the WebSocket wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client request.
    Req {
        /// Correlation id chosen by the client.
        id: String,

        /// Method name, e.g. `chat.send`.
        method: String,

        /// Method parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server response, correlated to a request by id.
    Res {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    /// Server push, independent of request/response correlation.
    Event {
        /// Event name, e.g. `chat.event`.
        event: String,

        /// Event payload.
        payload: serde_json::Value,
    },
}

impl Frame {
    /// Successful response frame.
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Error response frame.
    pub fn err(id: impl Into<String>, error: &GatewayError) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ErrorBody::from(error)),
        }
    }

    /// Event push frame.
    pub fn event(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
        }
    }
}

/// Structured error carried in a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error kind identifier.
    pub kind: String,

    /// Human-readable message.
    pub message: String,

    /// Whether the caller may reasonably retry.
    pub retryable: bool,
}

impl From<&GatewayError> for ErrorBody {
    fn from(error: &GatewayError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}
