//! Worker wire protocol types.
//!
//! Workers speak newline-delimited JSON over stdio. Each outbound line is a
//! [`WorkerCommand`]; each inbound line is either a [`WorkerResponse`]
//! (correlated by request id) or a streamed [`WorkerEvent`] belonging to the
//! turn in flight.

use serde::{Deserialize, Serialize};

/// Worker lifecycle state, as tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Process spawned, not yet serving.
    Starting,

    /// Available for acquisition.
    Ready,

    /// Serving exactly one session.
    Busy,

    /// Out of service; scheduled for termination and replacement.
    Unhealthy,

    /// Being shut down.
    Terminating,
}

/// A command written to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Request id, unique per client (`req_N`).
    pub id: String,

    /// Operation name.
    pub op: String,

    /// Operation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl WorkerCommand {
    /// Create a new command.
    pub fn new(id: impl Into<String>, op: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            params,
        }
    }
}

/// A response line correlated to a command by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Request id this response resolves.
    pub id: String,

    /// Whether the command succeeded.
    pub ok: bool,

    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A streamed event emitted by a worker during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// The worker started producing a response.
    MessageStart,

    /// Incremental assistant text.
    TextDelta { text: String },

    /// The worker invoked a tool.
    ToolCall {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// The response is complete. Terminal.
    MessageEnd,

    /// The turn failed inside the worker. Terminal.
    Error { message: String },
}

impl WorkerEvent {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::MessageEnd | WorkerEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_omits_empty_params() {
        let cmd = WorkerCommand::new("req_1", "ping", None);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_event_parse_text_delta() {
        let event: WorkerEvent =
            serde_json::from_str(r#"{"type":"text_delta","text":"hi"}"#).unwrap();
        assert_eq!(
            event,
            WorkerEvent::TextDelta {
                text: "hi".to_string()
            }
        );
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_events() {
        assert!(WorkerEvent::MessageEnd.is_terminal());
        assert!(WorkerEvent::Error {
            message: "boom".to_string()
        }
        .is_terminal());
        assert!(!WorkerEvent::MessageStart.is_terminal());
    }

    #[test]
    fn test_response_parse() {
        let resp: WorkerResponse =
            serde_json::from_str(r#"{"type":"response","id":"req_3","ok":true,"data":{"pong":true}}"#)
                .unwrap();
        assert_eq!(resp.id, "req_3");
        assert!(resp.ok);
    }
}
