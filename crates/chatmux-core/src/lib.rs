//! # chatmux-core
//!
//! Core types, configuration, and errors for ChatMux.
//!
//! This crate provides shared functionality used across all ChatMux crates:
//!
//! - **Configuration**: Loading and validation of the gateway config file
//! - **Types**: Common type definitions for sessions, messages, and the
//!   worker wire protocol
//! - **Errors**: The core error type shared by config and type handling

pub mod config;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
