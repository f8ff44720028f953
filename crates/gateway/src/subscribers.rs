//! Live push subscribers (WebSocket connections).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Serialized frame shared by every subscriber of one broadcast.
pub type Frame = Arc<str>;

/// Handle identifying one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the frame was queued for.
    pub delivered: usize,
    /// Subscribers removed because their connection is gone.
    pub dropped: usize,
}

/// Set of live push subscribers.
///
/// Each subscriber is the sending half of a per-connection queue drained by
/// that connection's single writer task.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<Frame>>>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber; it receives every broadcast started after this call.
    pub fn register(&self, sender: mpsc::UnboundedSender<Frame>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().insert(id, sender);
        debug!(subscriber = %id, "Subscriber registered");
        id
    }

    /// Removes a subscriber. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber unregistered");
        }
        removed
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes `message` once and queues it for every current subscriber.
    ///
    /// Subscribers whose queue is closed are removed; the others still get
    /// the frame.
    pub fn broadcast_all<T: Serialize + ?Sized>(&self, message: &T) -> BroadcastReport {
        let frame: Frame = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!("Failed to serialize broadcast payload: {e}");
                return BroadcastReport::default();
            }
        };

        let snapshot: Vec<(SubscriberId, mpsc::UnboundedSender<Frame>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, tx) in snapshot {
            if tx.send(frame.clone()).is_ok() {
                report.delivered += 1;
            } else if self.unregister(id) {
                report.dropped += 1;
            }
        }
        report
    }
}
