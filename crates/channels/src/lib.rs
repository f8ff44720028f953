//! Outer surfaces of the gateway: the HTTP/WebSocket API and the bridge
//! session client.

pub mod bridge;
pub mod http;

/// Bridge subprocess session client.
pub use bridge::{BridgeClient, BridgeCommand, BridgeConfig, BridgeEvent};
/// HTTP API router and server.
pub use http::{ApiError, HttpConfig, router, serve};
