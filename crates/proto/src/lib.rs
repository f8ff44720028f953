//! Shared protocol types for the gateway core, its HTTP surface and the CLI.
//!
//! This crate defines addressing/identity types, the inbound event shapes
//! delivered to sinks, and strongly-typed error enums shared across the
//! workspace.

pub mod error;
pub mod event;
pub mod message;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of inbound event and sink payload types.
pub use event::{InboundEvent, PayloadFormat, PushMessage};
/// Re-export of identity/addressing types.
pub use message::{DEFAULT_USER_SERVER, Identity, Jid};
