//! Common type definitions.

mod message;
mod session;
mod worker;

pub use message::*;
pub use session::*;
pub use worker::*;
