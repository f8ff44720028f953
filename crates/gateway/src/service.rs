//! Gateway operations shared by the HTTP API and the CLI.

use std::sync::Arc;
use std::time::Duration;

use proto::{GatewayError, Identity, Jid};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::client::{QrEvent, SessionClient};
use crate::dispatcher::{DispatchPolicy, EventDispatcher};
use crate::qr::QrArtifact;
use crate::session::{LoginStatus, SessionState};
use crate::store::DeviceStore;
use crate::subscribers::SubscriberRegistry;
use crate::webhooks::{WebhookAdded, WebhookRegistry, WebhookRemoved, WebhookSettings};

/// How [`GatewayService::start`] brought the session up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// A stored device was found and the session resumed.
    Restored(Identity),
    /// No stored device; a QR login is required.
    NeedsLogin,
}

/// Result of one QR login round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated(Identity),
    /// No code was scanned before the challenge window closed.
    TimedOut,
}

/// The gateway: session lifecycle, sending, and sink registries.
pub struct GatewayService {
    client: Arc<dyn SessionClient>,
    session: Arc<SessionState>,
    subscribers: Arc<SubscriberRegistry>,
    webhooks: Arc<WebhookRegistry>,
    store: Arc<dyn DeviceStore>,
    qr: QrArtifact,
    logged_out: Arc<Notify>,
    lifecycle: Mutex<()>,
}

impl GatewayService {
    pub fn new(
        client: Arc<dyn SessionClient>,
        store: Arc<dyn DeviceStore>,
        qr: QrArtifact,
        webhooks: WebhookSettings,
    ) -> Self {
        Self {
            client,
            session: Arc::new(SessionState::new()),
            subscribers: Arc::new(SubscriberRegistry::new()),
            webhooks: Arc::new(WebhookRegistry::new(webhooks)),
            store,
            qr,
            logged_out: Arc::new(Notify::new()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Resumes a stored device, or reports that a login is needed.
    ///
    /// A stored device that fails to reconnect is fatal.
    pub async fn start(&self) -> Result<StartMode, GatewayError> {
        let _guard = self.lifecycle.lock().await;
        let Some(identity) = self.store.first_device().await? else {
            info!("No stored device, QR login required");
            return Ok(StartMode::NeedsLogin);
        };

        self.session.restore(identity.clone())?;
        if let Err(e) = self.client.connect().await {
            let _ = self.session.logout();
            return Err(GatewayError::Configuration(format!(
                "failed to resume stored device {identity}: {e}"
            )));
        }
        Ok(StartMode::Restored(identity))
    }

    /// Runs one QR login round.
    pub async fn login(&self) -> Result<LoginOutcome, GatewayError> {
        self.login_with(|_| {}).await
    }

    /// Runs one QR login round, passing every issued code to `on_code`.
    ///
    /// Each code is also written to the QR artifact. Returns when the
    /// device is linked, the challenge window closes, or the client fails.
    pub async fn login_with<F>(&self, mut on_code: F) -> Result<LoginOutcome, GatewayError>
    where
        F: FnMut(&str) + Send,
    {
        let _guard = self.lifecycle.lock().await;
        self.session.begin_login()?;

        // The QR stream must exist before connecting.
        let mut qr_events = match self.client.qr_channel().await {
            Ok(rx) => rx,
            Err(e) => {
                self.session.login_timed_out();
                return Err(GatewayError::DeliveryFailed(e.to_string()));
            }
        };
        if let Err(e) = self.client.connect().await {
            self.session.login_timed_out();
            return Err(GatewayError::DeliveryFailed(e.to_string()));
        }

        while let Some(event) = qr_events.recv().await {
            match event {
                QrEvent::Code(code) => {
                    self.session.record_qr(code.as_str());
                    if let Err(e) = self.qr.write(&code).await {
                        warn!("Failed to write QR artifact: {e}");
                    }
                    on_code(&code);
                    debug!("QR code issued");
                }
                QrEvent::Success => return self.finish_login().await,
                QrEvent::Timeout => break,
                QrEvent::Error(message) => {
                    self.session.login_timed_out();
                    self.qr.remove().await;
                    return Err(GatewayError::DeliveryFailed(message));
                }
            }
        }

        info!("QR login timed out");
        self.session.login_timed_out();
        self.qr.remove().await;
        Ok(LoginOutcome::TimedOut)
    }

    async fn finish_login(&self) -> Result<LoginOutcome, GatewayError> {
        let Some(identity) = self.client.current_identity() else {
            self.session.login_timed_out();
            return Err(GatewayError::NotAuthenticated);
        };
        self.session.complete_login(identity.clone())?;
        self.qr.remove().await;
        if let Err(e) = self.store.save_device(&identity).await {
            warn!(identity = %identity, "Failed to persist device: {e}");
        }
        Ok(LoginOutcome::Authenticated(identity))
    }

    /// Stops issuing QR codes; status reports `waiting` afterwards.
    pub fn abandon_login(&self) {
        self.session.abandon_login();
    }

    pub fn login_status(&self) -> LoginStatus {
        self.session.snapshot()
    }

    /// Sends a text message to `recipient` (a JID or bare phone number).
    pub async fn send(&self, recipient: &str, text: &str) -> Result<(), GatewayError> {
        let to: Jid = recipient.parse()?;
        if !self.session.is_authenticated() {
            return Err(GatewayError::NotConnected);
        }
        self.client
            .send_text(&to, text)
            .await
            .map_err(|e| GatewayError::DeliveryFailed(e.to_string()))?;
        debug!(to = %to, "Message sent");
        Ok(())
    }

    pub fn register_webhook(&self, url: &str) -> Result<WebhookAdded, GatewayError> {
        let url = validate_url(url)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(GatewayError::MalformedRequest(
                "url must start with http:// or https://".to_string(),
            ));
        }
        Ok(self.webhooks.add(url))
    }

    pub fn deregister_webhook(&self, url: &str) -> Result<WebhookRemoved, GatewayError> {
        Ok(self.webhooks.remove(validate_url(url)?))
    }

    pub fn list_webhooks(&self) -> Vec<String> {
        self.webhooks.list()
    }

    /// Unlinks the device and forgets it locally.
    pub async fn logout(&self) -> Result<(), GatewayError> {
        if !self.session.is_authenticated() {
            return Err(GatewayError::NotAuthenticated);
        }
        let _guard = self.lifecycle.lock().await;
        if !self.session.is_authenticated() {
            return Err(GatewayError::NotAuthenticated);
        }
        self.client
            .logout()
            .await
            .map_err(|e| GatewayError::DeliveryFailed(e.to_string()))?;

        // A `LoggedOut` event may already have been dispatched; whoever
        // clears the session runs the cleanup.
        let Ok(identity) = self.session.logout() else {
            debug!("Session already cleared by remote logout");
            return Ok(());
        };
        self.qr.remove().await;
        if let Err(e) = self.store.delete_device(&identity).await {
            warn!(identity = %identity, "Failed to delete stored device: {e}");
        }
        info!(identity = %identity, "Logged out");
        self.logged_out.notify_one();
        Ok(())
    }

    /// Resolves once the device has been unlinked, locally or remotely.
    pub async fn logged_out(&self) {
        self.logged_out.notified().await;
    }

    /// Builds the dispatcher feeding this service's sinks.
    pub fn dispatcher(&self, policy: DispatchPolicy) -> EventDispatcher {
        EventDispatcher::new(
            self.session.clone(),
            self.subscribers.clone(),
            self.webhooks.clone(),
            self.qr.clone(),
            self.store.clone(),
            self.logged_out.clone(),
            policy,
        )
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    pub fn qr_artifact(&self) -> &QrArtifact {
        &self.qr
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn client(&self) -> &Arc<dyn SessionClient> {
        &self.client
    }

    /// Drains webhook deliveries for up to `grace`, then disconnects.
    pub async fn shutdown(&self, grace: Duration) {
        self.webhooks.shutdown(grace).await;
        self.client.disconnect().await;
        info!("Gateway stopped");
    }
}

fn validate_url(url: &str) -> Result<&str, GatewayError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(GatewayError::MalformedRequest("bad json".to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeClient;
    use crate::session::{LoginPhase, LoginState};
    use crate::store::MemoryDeviceStore;
    use std::sync::atomic::Ordering;

    struct Fixture {
        service: GatewayService,
        client: Arc<FakeClient>,
        store: Arc<MemoryDeviceStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(client: FakeClient, store: MemoryDeviceStore) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = Arc::new(client);
        let store = Arc::new(store);
        let service = GatewayService::new(
            client.clone(),
            store.clone(),
            QrArtifact::new(dir.path().join("qr.png")),
            WebhookSettings::default(),
        );
        Fixture {
            service,
            client,
            store,
            _dir: dir,
        }
    }

    async fn logged_in() -> Fixture {
        let fx = fixture(
            FakeClient::default(),
            MemoryDeviceStore::with_device(Identity::from("628123")),
        );
        *fx.client.identity.lock() = Some(Identity::from("628123"));
        fx.service.start().await.expect("start");
        fx
    }

    #[tokio::test]
    async fn start_without_device_needs_login() {
        let fx = fixture(FakeClient::default(), MemoryDeviceStore::new());
        assert_eq!(fx.service.start().await.expect("start"), StartMode::NeedsLogin);
        assert_eq!(fx.client.connects.load(Ordering::SeqCst), 0);
        assert_eq!(fx.service.login_status().status, LoginPhase::WaitingQr);
    }

    #[tokio::test]
    async fn start_restores_stored_device() {
        let fx = logged_in().await;
        assert_eq!(fx.client.connects.load(Ordering::SeqCst), 1);
        let status = fx.service.login_status();
        assert_eq!(status.status, LoginPhase::LoggedIn);
        assert_eq!(status.logged_in_as.as_deref(), Some("628123"));
    }

    #[tokio::test]
    async fn failed_reconnect_is_fatal_configuration_error() {
        let client = FakeClient::default();
        client.fail_connect.store(true, Ordering::SeqCst);
        let fx = fixture(client, MemoryDeviceStore::with_device(Identity::from("1")));
        let err = fx.service.start().await.expect_err("must fail");
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert_eq!(fx.service.session().state(), LoginState::Unauthenticated);
    }

    #[tokio::test]
    async fn qr_login_success_persists_device_and_clears_artifact() {
        let client = FakeClient::with_qr(
            vec![
                QrEvent::Code("code-1".to_string()),
                QrEvent::Code("code-2".to_string()),
                QrEvent::Success,
            ],
            "628555",
        );
        let fx = fixture(client, MemoryDeviceStore::new());
        let mut seen = Vec::new();
        let outcome = fx
            .service
            .login_with(|code| seen.push(code.to_string()))
            .await
            .expect("login");

        assert_eq!(outcome, LoginOutcome::Authenticated(Identity::from("628555")));
        assert_eq!(seen, ["code-1", "code-2"]);
        assert_eq!(
            fx.store.first_device().await.expect("query"),
            Some(Identity::from("628555"))
        );
        assert!(fx.service.qr_artifact().read().await.is_none());
        assert_eq!(fx.service.login_status().status, LoginPhase::LoggedIn);
    }

    #[tokio::test]
    async fn qr_login_timeout_leaves_artifact_cleared_and_allows_retry() {
        let client = FakeClient::with_qr(
            vec![QrEvent::Code("code-1".to_string()), QrEvent::Timeout],
            "x",
        );
        let fx = fixture(client, MemoryDeviceStore::new());
        assert_eq!(
            fx.service.login().await.expect("login"),
            LoginOutcome::TimedOut
        );
        assert_eq!(fx.service.session().state(), LoginState::Unauthenticated);
        assert!(fx.service.qr_artifact().read().await.is_none());

        *fx.client.qr_script.lock() = vec![QrEvent::Success];
        assert!(matches!(
            fx.service.login().await.expect("retry"),
            LoginOutcome::Authenticated(_)
        ));
    }

    #[tokio::test]
    async fn login_when_already_authenticated_fails() {
        let fx = logged_in().await;
        assert!(matches!(
            fx.service.login().await,
            Err(GatewayError::AlreadyAuthenticated)
        ));
    }

    #[tokio::test]
    async fn send_with_invalid_recipient_never_reaches_client() {
        let fx = logged_in().await;
        let err = fx
            .service
            .send("not-a-valid-id", "hi")
            .await
            .expect_err("invalid");
        assert_eq!(err.to_string(), "invalid JID");
        assert!(fx.client.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn send_requires_login() {
        let fx = fixture(FakeClient::default(), MemoryDeviceStore::new());
        assert!(matches!(
            fx.service.send("628123@s.whatsapp.net", "hi").await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn send_delivers_and_wraps_client_errors() {
        let fx = logged_in().await;
        fx.service
            .send("628999", "halo")
            .await
            .expect("send bare number");
        assert_eq!(
            fx.client.sent.lock().as_slice(),
            [("628999@s.whatsapp.net".to_string(), "halo".to_string())]
        );

        *fx.client.fail_send.lock() = Some("server returned error 479".to_string());
        let err = fx
            .service
            .send("628999@s.whatsapp.net", "again")
            .await
            .expect_err("transport failure");
        assert!(matches!(err, GatewayError::DeliveryFailed(_)));
        assert_eq!(err.to_string(), "server returned error 479");
    }

    #[tokio::test]
    async fn webhook_registration_validates_urls() {
        let fx = fixture(FakeClient::default(), MemoryDeviceStore::new());
        assert!(matches!(
            fx.service.register_webhook("  "),
            Err(GatewayError::MalformedRequest(_))
        ));
        assert!(matches!(
            fx.service.register_webhook("ftp://x"),
            Err(GatewayError::MalformedRequest(_))
        ));
        let added = fx
            .service
            .register_webhook("https://example.com/hook")
            .expect("add");
        assert_eq!(added.total, 1);
        assert_eq!(fx.service.list_webhooks(), ["https://example.com/hook"]);
        let removed = fx
            .service
            .deregister_webhook("https://example.com/hook")
            .expect("remove");
        assert!(removed.removed);
        assert_eq!(removed.total, 0);
    }

    #[tokio::test]
    async fn logout_clears_identity_store_and_signals() {
        let fx = logged_in().await;
        fx.service.logout().await.expect("logout");

        assert_eq!(fx.service.session().identity(), None);
        assert_eq!(fx.store.first_device().await.expect("query"), None);
        tokio::time::timeout(Duration::from_secs(1), fx.service.logged_out())
            .await
            .expect("logout signalled");
        assert!(matches!(
            fx.service.logout().await,
            Err(GatewayError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn logout_succeeds_when_unlink_event_arrives_first() {
        let fx = logged_in().await;
        fx.client.logout_emits_event.store(true, Ordering::SeqCst);
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        fx.client.set_event_sink(tx);
        let dispatcher = fx.service.dispatcher(DispatchPolicy::default());
        let cancel = tokio_util::sync::CancellationToken::new();
        let worker = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(rx, cancel).await })
        };

        fx.service.logout().await.expect("logout");

        assert_eq!(fx.service.session().identity(), None);
        assert_eq!(fx.store.first_device().await.expect("query"), None);
        tokio::time::timeout(Duration::from_secs(1), fx.service.logged_out())
            .await
            .expect("logout signalled");
        cancel.cancel();
        worker.await.expect("dispatcher");
    }

    #[tokio::test]
    async fn failed_logout_keeps_session() {
        let fx = logged_in().await;
        fx.client.fail_logout.store(true, Ordering::SeqCst);
        assert!(matches!(
            fx.service.logout().await,
            Err(GatewayError::DeliveryFailed(_))
        ));
        assert!(fx.service.session().is_authenticated());
    }

    #[tokio::test]
    async fn shutdown_disconnects_client() {
        let fx = logged_in().await;
        fx.service.shutdown(Duration::from_millis(100)).await;
        assert_eq!(fx.client.disconnects.load(Ordering::SeqCst), 1);
    }
}
