//! Worker error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that can occur in the worker pool and RPC client.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// No worker became available within the acquire timeout.
    #[error("no worker available within {0:?}")]
    PoolExhausted(Duration),

    /// The worker process died mid-request.
    #[error("worker process died: {0}")]
    WorkerCrashed(String),

    /// No response received within the idle window.
    #[error("no response within {0:?}")]
    RequestTimeout(Duration),

    /// The client was torn down with requests outstanding.
    #[error("client closed")]
    ClientClosed,

    /// The worker rejected a command.
    #[error("worker rejected request: {0}")]
    Rpc(String),

    /// The worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Unparseable or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted(_) | Self::WorkerCrashed(_) | Self::RequestTimeout(_)
        )
    }

    /// Stable wire identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::WorkerCrashed(_) => "worker_crashed",
            Self::RequestTimeout(_) => "request_timeout",
            Self::ClientClosed => "client_closed",
            Self::Rpc(_) => "rpc_error",
            Self::Spawn(_) => "spawn_failed",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(WorkerError::PoolExhausted(Duration::from_secs(1)).is_retryable());
        assert!(WorkerError::WorkerCrashed("gone".into()).is_retryable());
        assert!(WorkerError::RequestTimeout(Duration::from_secs(30)).is_retryable());
        assert!(!WorkerError::ClientClosed.is_retryable());
        assert!(!WorkerError::Protocol("bad".into()).is_retryable());
    }

    #[test]
    fn test_kind_strings_stable() {
        assert_eq!(WorkerError::ClientClosed.kind(), "client_closed");
        assert_eq!(
            WorkerError::PoolExhausted(Duration::from_millis(10)).kind(),
            "pool_exhausted"
        );
    }
}
