//! Gateway core: session lifecycle, event fan-out and payload normalization.

pub mod client;
pub mod dispatcher;
pub mod normalize;
pub mod qr;
pub mod service;
pub mod session;
pub mod store;
pub mod subscribers;
pub mod webhooks;

/// Session client seam and its event types.
pub use client::{ProtocolEvent, QrEvent, SessionClient};
/// Inbound event delivery.
pub use dispatcher::{DispatchOutcome, DispatchPolicy, EventDispatcher};
/// Base64-aware payload normalizer.
pub use normalize::normalize;
/// QR artifact and terminal rendering.
pub use qr::{QrArtifact, render_terminal};
/// Gateway operations.
pub use service::{GatewayService, LoginOutcome, StartMode};
/// Login state tracking.
pub use session::{LoginPhase, LoginState, LoginStatus, SessionState};
/// Device persistence.
pub use store::{DeviceStore, MemoryDeviceStore, SqliteDeviceStore};
/// Push subscribers.
pub use subscribers::{BroadcastReport, Frame, SubscriberId, SubscriberRegistry};
/// Webhook targets.
pub use webhooks::{WebhookAdded, WebhookRegistry, WebhookRemoved, WebhookSettings};
