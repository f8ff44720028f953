//! Delivery of inbound events to push subscribers and webhooks.

use std::sync::Arc;

use proto::{InboundEvent, PayloadFormat, PushMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ProtocolEvent;
use crate::normalize::normalize;
use crate::qr::QrArtifact;
use crate::session::SessionState;
use crate::store::DeviceStore;
use crate::subscribers::SubscriberRegistry;
use crate::webhooks::WebhookRegistry;

/// Per-sink payload shapes and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPolicy {
    /// Drop events with no text and no structured payload.
    pub skip_empty: bool,
    pub push_format: PayloadFormat,
    pub webhook_format: PayloadFormat,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            skip_empty: false,
            push_format: PayloadFormat::Simple,
            webhook_format: PayloadFormat::Rich,
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent by the logged-in account itself.
    SelfMessage,
    /// Nothing to deliver under `skip_empty`.
    Empty,
    /// Payload could not be built.
    Failed,
    Delivered { subscribers: usize, webhooks: usize },
}

/// Consumes protocol events and feeds both sinks.
pub struct EventDispatcher {
    session: Arc<SessionState>,
    subscribers: Arc<SubscriberRegistry>,
    webhooks: Arc<WebhookRegistry>,
    qr: QrArtifact,
    store: Arc<dyn DeviceStore>,
    logged_out: Arc<Notify>,
    policy: DispatchPolicy,
}

impl EventDispatcher {
    pub(crate) fn new(
        session: Arc<SessionState>,
        subscribers: Arc<SubscriberRegistry>,
        webhooks: Arc<WebhookRegistry>,
        qr: QrArtifact,
        store: Arc<dyn DeviceStore>,
        logged_out: Arc<Notify>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            session,
            subscribers,
            webhooks,
            qr,
            store,
            logged_out,
            policy,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Delivers one event to every subscriber and webhook.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        if self.is_own_message(event) {
            debug!(id = %event.id, "Skipping self-originated message");
            return DispatchOutcome::SelfMessage;
        }
        if self.policy.skip_empty && !event.has_content() {
            debug!(id = %event.id, sender = %event.sender_id, "Skipping empty message");
            return DispatchOutcome::Empty;
        }

        let push = match render(self.policy.push_format, event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %event.id, "Failed to build push payload: {e}");
                return DispatchOutcome::Failed;
            }
        };
        let hook = if self.policy.webhook_format == self.policy.push_format {
            push.clone()
        } else {
            match render(self.policy.webhook_format, event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(id = %event.id, "Failed to build webhook payload: {e}");
                    return DispatchOutcome::Failed;
                }
            }
        };

        let report = self.subscribers.broadcast_all(&push);
        let webhooks = self.webhooks.fan_out(&hook).await;
        debug!(
            id = %event.id,
            sender = %event.sender_id,
            subscribers = report.delivered,
            dropped = report.dropped,
            webhooks,
            "Event dispatched"
        );
        DispatchOutcome::Delivered {
            subscribers: report.delivered,
            webhooks,
        }
    }

    /// Worker loop over the session client's event stream.
    ///
    /// Returns when the stream closes or `cancel` fires.
    pub async fn run(&self, mut events: mpsc::Receiver<ProtocolEvent>, cancel: CancellationToken) {
        info!("Event dispatcher started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                debug!("Protocol event stream closed");
                break;
            };
            match event {
                ProtocolEvent::Message(message) => {
                    self.dispatch(&message).await;
                }
                ProtocolEvent::LoggedOut => self.handle_remote_logout().await,
                ProtocolEvent::Connected => info!("Session connected"),
                ProtocolEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "Session disconnected")
                }
            }
        }
        info!("Event dispatcher stopped");
    }

    fn is_own_message(&self, event: &InboundEvent) -> bool {
        event.is_from_me
            || self
                .session
                .identity()
                .is_some_and(|me| me.as_str() == event.sender_user())
    }

    async fn handle_remote_logout(&self) {
        let Ok(identity) = self.session.logout() else {
            debug!("Logout notification while not logged in");
            return;
        };
        warn!(identity = %identity, "Device was unlinked remotely");
        self.qr.remove().await;
        if let Err(e) = self.store.delete_device(&identity).await {
            warn!(identity = %identity, "Failed to delete stored device: {e}");
        }
        self.logged_out.notify_one();
    }
}

fn render(format: PayloadFormat, event: &InboundEvent) -> Result<Value, serde_json::Error> {
    match format {
        PayloadFormat::Simple => serde_json::to_value(PushMessage::from(event)),
        PayloadFormat::Rich => serde_json::to_value(event).map(|value| normalize(&value)),
    }
}
