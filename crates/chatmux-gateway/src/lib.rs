//! # chatmux-gateway
//!
//! Session registry, message pipeline, and WebSocket gateway for ChatMux.
//!
//! Inbound messages from channel plugins flow through the pipeline: resolve
//! a session, claim its turn slot, acquire a worker from the pool, and
//! stream the worker's events back out in order. UI clients speak a
//! request/response/event protocol over `/ws`, dispatched through the
//! method registry.

pub mod error;
pub mod frame;
pub mod handlers;
pub mod methods;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod store;

pub use error::{GatewayError, Result};
pub use frame::{ErrorBody, Frame};
pub use handlers::GatewayContext;
pub use methods::{MethodHandler, MethodRegistry};
pub use pipeline::{MessagePipeline, OutboundSink, TurnSummary};
pub use registry::SessionRegistry;
pub use server::GatewayServer;
pub use store::{SessionRecord, SessionStore, TranscriptEntry};
