//! Registered webhook targets and fire-and-forget fan-out.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC-SHA256 body signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Delivery settings for [`WebhookRegistry`].
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum concurrently running delivery tasks.
    pub max_in_flight: usize,
    /// Shared secret for body signatures; `None` sends unsigned requests.
    pub secret: Option<String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_in_flight: 256,
            secret: None,
        }
    }
}

/// Result of [`WebhookRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAdded {
    pub added: bool,
    pub total: usize,
}

/// Result of [`WebhookRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRemoved {
    pub removed: bool,
    pub total: usize,
}

/// Set of webhook URLs, kept in insertion order.
///
/// Deliveries never remove a URL, even when the endpoint keeps failing.
pub struct WebhookRegistry {
    urls: Mutex<Vec<String>>,
    http: reqwest::Client,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    secret: Option<String>,
}

impl WebhookRegistry {
    /// Creates an empty registry.
    pub fn new(settings: WebhookSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build webhook HTTP client ({e}), using defaults");
                reqwest::Client::new()
            });
        Self {
            urls: Mutex::new(Vec::new()),
            http,
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            secret: settings.secret.filter(|s| !s.is_empty()),
        }
    }

    /// Adds `url` unless already present.
    pub fn add(&self, url: &str) -> WebhookAdded {
        let mut urls = self.urls.lock();
        let added = !urls.iter().any(|u| u == url);
        if added {
            urls.push(url.to_string());
            info!(url, total = urls.len(), "Webhook registered");
        }
        WebhookAdded {
            added,
            total: urls.len(),
        }
    }

    /// Removes `url` if present.
    pub fn remove(&self, url: &str) -> WebhookRemoved {
        let mut urls = self.urls.lock();
        let before = urls.len();
        urls.retain(|u| u != url);
        let removed = urls.len() != before;
        if removed {
            info!(url, total = urls.len(), "Webhook removed");
        }
        WebhookRemoved {
            removed,
            total: urls.len(),
        }
    }

    /// Registered URLs in insertion order.
    pub fn list(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Number of delivery tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Delivers `payload` to every registered URL. Returns the number of targets.
    ///
    /// Each delivery runs as its own task; the call returns once they are
    /// spawned. When `max_in_flight` tasks are already running the delivery
    /// is performed inline instead.
    pub async fn fan_out<T: Serialize + ?Sized>(&self, payload: &T) -> usize {
        let targets = self.list();
        if targets.is_empty() {
            return 0;
        }
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to serialize webhook payload: {e}");
                return 0;
            }
        };
        let signature = self.secret.as_deref().map(|secret| sign(secret, &body));

        for url in &targets {
            let delivery = deliver(
                self.http.clone(),
                url.clone(),
                body.clone(),
                signature.clone(),
            );
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    self.tracker.spawn(async move {
                        delivery.await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    debug!(url = %url, "Webhook delivery limit reached, delivering inline");
                    delivery.await;
                }
            }
        }
        targets.len()
    }

    /// Stops accepting new deliveries and waits up to `grace` for running ones.
    ///
    /// Returns `false` if deliveries were still running when `grace` elapsed.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "Waiting for webhook deliveries");
        }
        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                abandoned = self.tracker.len(),
                "Abandoning unfinished webhook deliveries"
            );
        }
        drained
    }
}

/// POSTs one payload; failures are logged and dropped.
async fn deliver(http: reqwest::Client, url: String, body: String, signature: Option<String>) {
    let mut request = http
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(signature) = signature {
        request = request.header(SIGNATURE_HEADER, signature);
    }
    match request.send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!(url = %url, status = %resp.status(), "Webhook delivered");
        }
        Ok(resp) => {
            debug!(url = %url, status = %resp.status(), "Webhook endpoint rejected payload");
        }
        Err(e) => {
            debug!(url = %url, "Webhook delivery failed: {e}");
        }
    }
}

/// `sha256=<hex>` HMAC of `body`.
fn sign(secret: &str, body: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
