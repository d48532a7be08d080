//! System method handlers.

use super::GatewayContext;
use crate::methods::MethodHandler;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `ping`.
pub struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    async fn call(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}

/// `system.info`: build and platform identification.
pub struct SystemInfoHandler;

#[async_trait]
impl MethodHandler for SystemInfoHandler {
    async fn call(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "name": "chatmux-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        }))
    }
}

/// `system.health`: pool counters, session count, uptime.
pub struct SystemHealthHandler {
    context: Arc<GatewayContext>,
}

impl SystemHealthHandler {
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MethodHandler for SystemHealthHandler {
    async fn call(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let pool = self.context.pool.stats().await;
        let status = if pool.degraded { "degraded" } else { "ok" };
        let uptime = chrono::Utc::now() - self.context.started_at;
        Ok(serde_json::json!({
            "status": status,
            "pool": pool,
            "sessions": self.context.registry.active_count().await,
            "uptimeSecs": uptime.num_seconds(),
        }))
    }
}
