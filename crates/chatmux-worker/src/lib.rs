//! # chatmux-worker
//!
//! Worker process pool and RPC client for ChatMux.
//!
//! A worker is a backend agent-runtime process speaking newline-delimited
//! JSON over stdio. This crate owns the full worker lifecycle:
//!
//! - **Pool**: elastic set of workers with an acquire/release contract,
//!   FIFO wait-queue, health checks, and crash replacement
//! - **Client**: one logical connection to a single worker; request
//!   correlation, streamed turn events, timeouts, and kill escalation
//! - **Protocol**: line framing and parsing of the worker wire format

pub mod client;
pub mod error;
pub mod pool;
pub mod protocol;

pub use client::{ClientOptions, RpcClient, TurnStream};
pub use error::{Result, WorkerError};
pub use pool::{PoolStats, ProcessLauncher, WorkerLauncher, WorkerLease, WorkerPool};
