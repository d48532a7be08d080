//! RPC method handlers, grouped by domain.

mod chat;
mod config;
mod sessions;
mod system;

pub use chat::{ChatAbortHandler, ChatSendHandler};
pub use config::ConfigGetHandler;
pub use sessions::{
    SessionsDeleteHandler, SessionsGetHandler, SessionsListHandler, SessionsResetHandler,
};
pub use system::{PingHandler, SystemHealthHandler, SystemInfoHandler};

use crate::methods::MethodRegistry;
use crate::pipeline::MessagePipeline;
use crate::registry::SessionRegistry;
use chatmux_core::Config;
use chatmux_worker::WorkerPool;
use std::sync::Arc;

/// Shared context passed to method handlers.
pub struct GatewayContext {
    /// Full gateway configuration.
    pub config: Config,

    /// Worker pool.
    pub pool: WorkerPool,

    /// Session registry.
    pub registry: Arc<SessionRegistry>,

    /// Message pipeline.
    pub pipeline: Arc<MessagePipeline>,

    /// Process start time, for uptime reporting.
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl GatewayContext {
    /// Create a handler context.
    pub fn new(
        config: Config,
        pool: WorkerPool,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<MessagePipeline>,
    ) -> Self {
        Self {
            config,
            pool,
            registry,
            pipeline,
            started_at: chrono::Utc::now(),
        }
    }
}

/// Register every built-in method.
pub async fn register_all(registry: &MethodRegistry, context: Arc<GatewayContext>) {
    // chat
    registry
        .register("chat.send", Arc::new(ChatSendHandler::new(context.clone())))
        .await;
    registry
        .register(
            "chat.abort",
            Arc::new(ChatAbortHandler::new(context.clone())),
        )
        .await;

    // sessions
    registry
        .register(
            "sessions.list",
            Arc::new(SessionsListHandler::new(context.clone())),
        )
        .await;
    registry
        .register(
            "sessions.get",
            Arc::new(SessionsGetHandler::new(context.clone())),
        )
        .await;
    registry
        .register(
            "sessions.reset",
            Arc::new(SessionsResetHandler::new(context.clone())),
        )
        .await;
    registry
        .register(
            "sessions.delete",
            Arc::new(SessionsDeleteHandler::new(context.clone())),
        )
        .await;

    // system
    registry.register("ping", Arc::new(PingHandler)).await;
    registry
        .register("system.info", Arc::new(SystemInfoHandler))
        .await;
    registry
        .register(
            "system.health",
            Arc::new(SystemHealthHandler::new(context.clone())),
        )
        .await;

    // config
    registry
        .register(
            "config.get",
            Arc::new(ConfigGetHandler::new(context.config.clone())),
        )
        .await;
}
