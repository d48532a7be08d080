//! Session types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random session ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite key identifying one external conversation.
///
/// Unique among non-closed sessions; a closed session's key may be reused
/// by a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Channel type identifier (e.g. "telegram", "web").
    pub channel: String,

    /// Conversation ID as known by the channel.
    pub conversation_id: String,
}

impl ConversationKey {
    /// Create a new conversation key.
    pub fn new(channel: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.conversation_id)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Receiving traffic.
    #[default]
    Active,

    /// No traffic within the idle window; reactivated by inbound traffic.
    Idle,

    /// Being reset; transitions back to active.
    Resetting,

    /// Terminal. The conversation key is freed for a fresh session.
    Closed,
}

/// A logical conversation bound to one external channel identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session ID.
    pub id: SessionId,

    /// External conversation key.
    pub key: ConversationKey,

    /// Lifecycle state.
    #[serde(default)]
    pub state: SessionState,

    /// Worker currently serving this session, if a turn is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,

    /// Whether a turn is currently in flight.
    #[serde(default)]
    pub turn_in_flight: bool,

    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Timestamp of the last inbound message.
    pub last_message_at: chrono::DateTime<chrono::Utc>,

    /// Total inbound messages handled.
    #[serde(default)]
    pub message_count: u64,
}

impl Session {
    /// Create a fresh active session for a conversation key.
    pub fn new(key: ConversationKey) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: SessionId::generate(),
            key,
            state: SessionState::Active,
            assigned_worker: None,
            turn_in_flight: false,
            created_at: now,
            last_message_at: now,
            message_count: 0,
        }
    }

    /// Record inbound activity: bumps counters and reactivates idle sessions.
    pub fn touch(&mut self) {
        self.last_message_at = chrono::Utc::now();
        self.message_count += 1;
        if self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
    }

    /// Whether the session is in the terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Clear fields that must not survive a gateway restart.
    pub fn reset_runtime_state(&mut self) {
        self.turn_in_flight = false;
        self.assigned_worker = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_touch_reactivates_idle() {
        let mut session = Session::new(ConversationKey::new("telegram", "123"));
        session.state = SessionState::Idle;
        session.touch();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.message_count, 1);
    }

    #[test]
    fn test_reset_runtime_state() {
        let mut session = Session::new(ConversationKey::new("web", "abc"));
        session.turn_in_flight = true;
        session.assigned_worker = Some("rpc-1".to_string());
        session.reset_runtime_state();
        assert!(!session.turn_in_flight);
        assert!(session.assigned_worker.is_none());
    }

    #[test]
    fn test_session_state_serde() {
        let json = serde_json::to_string(&SessionState::Resetting).unwrap();
        assert_eq!(json, "\"resetting\"");
    }
}
