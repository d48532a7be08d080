//! Gateway error types.

use chatmux_worker::WorkerError;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway, registry, and pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A turn is already in flight for the session.
    #[error("session {0} already has a turn in flight")]
    SessionBusy(String),

    /// No session with the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Unknown RPC method.
    #[error("unknown method: {0}")]
    MethodNotFound(String),

    /// Request parameters failed to deserialize or validate.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Connection is not authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Worker pool or RPC failure.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable wire identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionBusy(_) => "session_busy",
            Self::SessionNotFound(_) => "session_not_found",
            Self::MethodNotFound(_) => "method_not_found",
            Self::InvalidParams(_) => "invalid_params",
            Self::Unauthorized(_) => "unauthorized",
            Self::Worker(e) => e.kind(),
            Self::Io(_) => "io_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Worker(e) => e.is_retryable(),
            _ => false,
        }
    }
}
