//! Session method handlers.

use super::GatewayContext;
use crate::methods::{parse_params, MethodHandler};
use crate::Result;
use async_trait::async_trait;
use chatmux_core::types::SessionId;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

impl SessionParams {
    fn id(&self) -> SessionId {
        SessionId::new(&self.session_id)
    }
}

/// `sessions.list`: all known sessions, newest first.
pub struct SessionsListHandler {
    context: Arc<GatewayContext>,
}

impl SessionsListHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for SessionsListHandler {
    async fn call(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut sessions = self.context.registry.list().await;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(serde_json::json!({ "sessions": sessions }))
    }
}

/// `sessions.get`: one session with its transcript.
pub struct SessionsGetHandler {
    context: Arc<GatewayContext>,
}

impl SessionsGetHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for SessionsGetHandler {
    async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params: SessionParams = parse_params(params)?;
        let id = params.id();
        let session = self
            .context
            .registry
            .get(&id)
            .await
            .ok_or_else(|| crate::error::GatewayError::SessionNotFound(id.to_string()))?;
        let transcript = self
            .context
            .registry
            .transcript(&id)
            .await
            .unwrap_or_default();
        Ok(serde_json::json!({
            "session": session,
            "transcript": transcript,
        }))
    }
}

/// `sessions.reset`: clear history and worker assignment, back to active.
pub struct SessionsResetHandler {
    context: Arc<GatewayContext>,
}

impl SessionsResetHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for SessionsResetHandler {
    async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params: SessionParams = parse_params(params)?;
        let session = self.context.registry.reset(&params.id()).await?;
        Ok(serde_json::json!({ "session": session }))
    }
}

/// `sessions.delete`: remove a session and its persisted record.
pub struct SessionsDeleteHandler {
    context: Arc<GatewayContext>,
}

impl SessionsDeleteHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for SessionsDeleteHandler {
    async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params: SessionParams = parse_params(params)?;
        self.context.registry.delete(&params.id()).await?;
        Ok(serde_json::json!({ "deleted": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_params_require_session_id() {
        let result: std::result::Result<SessionParams, _> =
            serde_json::from_value(serde_json::json!({ "wrong": "field" }));
        assert!(result.is_err());

        let params: SessionParams =
            serde_json::from_value(serde_json::json!({ "sessionId": "s1" })).unwrap();
        assert_eq!(params.id().as_str(), "s1");
    }
}
