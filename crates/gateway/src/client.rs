//! Seam between the gateway and the protocol session client.

use async_trait::async_trait;
use proto::{ClientError, Identity, InboundEvent, Jid};
use tokio::sync::mpsc;

/// One item of the QR login stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    /// A fresh challenge to render and scan.
    Code(String),
    /// The device was linked.
    Success,
    /// The challenge window closed without a scan.
    Timeout,
    /// The login attempt failed.
    Error(String),
}

/// Asynchronous notifications from the session client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Message(InboundEvent),
    Connected,
    Disconnected { reason: String },
    /// The device was unlinked remotely.
    LoggedOut,
}

/// The messaging protocol session.
///
/// Implementations own the protocol engine. The gateway only drives the
/// login handshake, sends text and consumes [`ProtocolEvent`]s.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Opens the session. With a stored device this resumes it.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Whether the client holds a linked device.
    fn is_authenticated(&self) -> bool;

    /// Identity of the linked device, if any.
    fn current_identity(&self) -> Option<Identity>;

    /// Stream of login events for the next [`connect`](Self::connect).
    ///
    /// Must be requested before `connect`.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError>;

    /// Sends a plain text message.
    async fn send_text(&self, to: &Jid, text: &str) -> Result<(), ClientError>;

    /// Unlinks the device.
    async fn logout(&self) -> Result<(), ClientError>;

    /// Closes the session; the device stays linked.
    async fn disconnect(&self);

    /// Registers the single consumer of protocol events.
    fn set_event_sink(&self, sink: mpsc::Sender<ProtocolEvent>);
}
