//! Authentication lifecycle of the gateway's protocol session.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use proto::{GatewayError, Identity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// URL path under which the current QR artifact is served.
pub const QR_FILE_REF: &str = "/qr";

/// Where the session is in its login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    /// No identity and no login in progress.
    Unauthenticated,
    /// Login initiated, QR challenges are being issued.
    AwaitingQr,
    /// Logged in (paired or restored).
    Authenticated,
}

/// Status value reported by `GET /login`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginPhase {
    /// Not logged in and no more QR codes will be issued.
    Waiting,
    /// Not logged in, scan the QR artifact to link a device.
    WaitingQr,
    /// Logged in.
    LoggedIn,
}

/// Snapshot of the session served to status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginStatus {
    pub status: LoginPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_in_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_time: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    state: LoginState,
    identity: Option<Identity>,
    login_time: Option<DateTime<Utc>>,
    last_qr: Option<(String, DateTime<Utc>)>,
    abandoned: bool,
}

/// Tracks login state and the current identity.
///
/// `state == Authenticated` holds exactly when an identity is present; every
/// transition updates both under one write lock.
#[derive(Debug)]
pub struct SessionState {
    inner: RwLock<Inner>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Creates an unauthenticated session.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: LoginState::Unauthenticated,
                identity: None,
                login_time: None,
                last_qr: None,
                abandoned: false,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> LoginState {
        self.inner.read().state
    }

    /// Current identity, `None` unless authenticated.
    pub fn identity(&self) -> Option<Identity> {
        self.inner.read().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == LoginState::Authenticated
    }

    /// Latest QR challenge, if a login is in progress.
    pub fn current_qr(&self) -> Option<String> {
        let inner = self.inner.read();
        match inner.state {
            LoginState::AwaitingQr => inner.last_qr.as_ref().map(|(code, _)| code.clone()),
            _ => None,
        }
    }

    /// Unauthenticated → AwaitingQr. A no-op while already awaiting a scan.
    pub fn begin_login(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.write();
        match inner.state {
            LoginState::Authenticated => Err(GatewayError::AlreadyAuthenticated),
            LoginState::AwaitingQr => Ok(()),
            LoginState::Unauthenticated => {
                inner.state = LoginState::AwaitingQr;
                inner.abandoned = false;
                inner.last_qr = None;
                debug!("Login started, awaiting QR scan");
                Ok(())
            }
        }
    }

    /// Stores a freshly issued QR challenge. Ignored unless awaiting a scan.
    pub fn record_qr(&self, code: impl Into<String>) -> bool {
        let mut inner = self.inner.write();
        if inner.state != LoginState::AwaitingQr {
            return false;
        }
        inner.last_qr = Some((code.into(), Utc::now()));
        true
    }

    /// AwaitingQr → Authenticated after a successful scan.
    pub fn complete_login(&self, identity: Identity) -> Result<(), GatewayError> {
        if identity.is_empty() {
            return Err(GatewayError::NotAuthenticated);
        }
        let mut inner = self.inner.write();
        match inner.state {
            LoginState::AwaitingQr => {
                info!(identity = %identity, "Logged in via QR");
                inner.state = LoginState::Authenticated;
                inner.identity = Some(identity);
                inner.login_time = Some(Utc::now());
                inner.last_qr = None;
                Ok(())
            }
            LoginState::Authenticated => Err(GatewayError::AlreadyAuthenticated),
            LoginState::Unauthenticated => Err(GatewayError::NotAuthenticated),
        }
    }

    /// AwaitingQr → Unauthenticated when the QR stream ends without a scan.
    pub fn login_timed_out(&self) {
        let mut inner = self.inner.write();
        if inner.state == LoginState::AwaitingQr {
            inner.state = LoginState::Unauthenticated;
            inner.last_qr = None;
            debug!("QR login timed out");
        }
    }

    /// Marks that no further login attempts will be made.
    pub fn abandon_login(&self) {
        let mut inner = self.inner.write();
        if inner.state != LoginState::Authenticated {
            inner.state = LoginState::Unauthenticated;
            inner.last_qr = None;
            inner.abandoned = true;
        }
    }

    /// Unauthenticated → Authenticated from a stored identity.
    pub fn restore(&self, identity: Identity) -> Result<(), GatewayError> {
        if identity.is_empty() {
            return Err(GatewayError::NotAuthenticated);
        }
        let mut inner = self.inner.write();
        if inner.state == LoginState::Authenticated {
            return Err(GatewayError::AlreadyAuthenticated);
        }
        info!(identity = %identity, "Session restored from store");
        inner.state = LoginState::Authenticated;
        inner.identity = Some(identity);
        inner.login_time = Some(Utc::now());
        inner.last_qr = None;
        inner.abandoned = false;
        Ok(())
    }

    /// Authenticated → Unauthenticated, returning the identity that was cleared.
    pub fn logout(&self) -> Result<Identity, GatewayError> {
        let mut inner = self.inner.write();
        if inner.state != LoginState::Authenticated {
            return Err(GatewayError::NotAuthenticated);
        }
        inner.state = LoginState::Unauthenticated;
        inner.login_time = None;
        inner.identity.take().ok_or(GatewayError::NotAuthenticated)
    }

    /// Status snapshot for `GET /login`.
    pub fn snapshot(&self) -> LoginStatus {
        let inner = self.inner.read();
        let generated_at = Utc::now();
        match inner.state {
            LoginState::Authenticated => LoginStatus {
                status: LoginPhase::LoggedIn,
                qr_file: None,
                logged_in_as: inner.identity.as_ref().map(|id| id.to_string()),
                login_time: inner.login_time,
                generated_at,
            },
            LoginState::Unauthenticated if inner.abandoned => LoginStatus {
                status: LoginPhase::Waiting,
                qr_file: None,
                logged_in_as: None,
                login_time: None,
                generated_at,
            },
            LoginState::Unauthenticated | LoginState::AwaitingQr => LoginStatus {
                status: LoginPhase::WaitingQr,
                qr_file: Some(QR_FILE_REF.to_string()),
                logged_in_as: None,
                login_time: None,
                generated_at,
            },
        }
    }
}
