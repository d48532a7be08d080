//! Chat method handlers.

use super::GatewayContext;
use crate::methods::{parse_params, MethodHandler};
use crate::Result;
use async_trait::async_trait;
use chatmux_core::types::{InboundMessage, SessionId};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams {
    channel: String,
    conversation_id: String,
    text: String,
}

/// `chat.send`: run one turn and return its final status.
///
/// Streamed events are pushed to subscribers while the call is in flight;
/// the response arrives once the turn settles.
pub struct ChatSendHandler {
    context: Arc<GatewayContext>,
}

impl ChatSendHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for ChatSendHandler {
    async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params: ChatSendParams = parse_params(params)?;
        let summary = self
            .context
            .pipeline
            .handle_inbound(InboundMessage::new(
                params.channel,
                params.conversation_id,
                params.text,
            ))
            .await?;
        Ok(serde_json::to_value(summary)
            .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatAbortParams {
    session_id: String,
}

/// `chat.abort`: cancel the turn in flight for a session.
pub struct ChatAbortHandler {
    context: Arc<GatewayContext>,
}

impl ChatAbortHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for ChatAbortHandler {
    async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let params: ChatAbortParams = parse_params(params)?;
        self.context
            .pipeline
            .abort(&SessionId::new(params.session_id))
            .await?;
        Ok(serde_json::json!({ "aborted": true }))
    }
}
