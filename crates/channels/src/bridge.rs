//! Session client backed by a Node.js bridge subprocess.
//!
//! The bridge owns the messaging protocol engine and speaks newline-delimited
//! JSON: [`BridgeEvent`]s on stdout, [`BridgeCommand`]s on stdin.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use gateway::{ProtocolEvent, QrEvent, SessionClient};
use parking_lot::{Mutex, RwLock};
use proto::{ClientError, Identity, InboundEvent, Jid};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How to launch the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Node.js executable.
    pub node_bin: String,
    /// Bridge entry script.
    pub bridge_path: String,
    /// Directory holding the bridge's session credentials.
    pub session_dir: String,
    /// How long to wait for a command result.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_bin: "node".to_string(),
            bridge_path: "whatsapp-bridge/index.js".to_string(),
            session_dir: "~/.wagate/session".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ─── Wire types ────────────────────────────────────────────

/// One line written by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        data: String,
    },
    Connected {
        phone: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// The QR challenge window closed.
    Timeout,
    Message {
        #[serde(default)]
        id: String,
        from: String,
        #[serde(default)]
        chat: Option<String>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        timestamp: i64,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        raw: serde_json::Value,
    },
    Result {
        request_id: String,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    LoggedOut,
    Error {
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// One line written to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    Send {
        request_id: String,
        to: String,
        text: String,
    },
    Logout {
        request_id: String,
    },
}

// ─── Shared state ──────────────────────────────────────────

type Pending = oneshot::Sender<Result<(), String>>;

/// State shared between the client and its stdout reader task.
#[derive(Default)]
struct Shared {
    pending: DashMap<String, Pending>,
    identity: RwLock<Option<Identity>>,
    qr_tx: Mutex<Option<mpsc::Sender<QrEvent>>>,
    sink: Mutex<Option<mpsc::Sender<ProtocolEvent>>>,
}

impl Shared {
    async fn emit(&self, event: ProtocolEvent) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                if sink.send(event).await.is_err() {
                    debug!("Protocol event sink closed");
                }
            }
            None => debug!("No protocol event sink registered"),
        }
    }

    async fn emit_qr(&self, event: QrEvent, last: bool) {
        let tx = if last {
            self.qr_tx.lock().take()
        } else {
            self.qr_tx.lock().clone()
        };
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Applies one stdout line.
    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event = match serde_json::from_str::<BridgeEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping unparseable bridge line ({e}): {line}");
                return;
            }
        };

        match event {
            BridgeEvent::Qr { data } => self.emit_qr(QrEvent::Code(data), false).await,
            BridgeEvent::Connected { phone, name } => {
                let identity = Identity::from(phone_user(&phone));
                info!(
                    identity = %identity,
                    name = name.as_deref().unwrap_or(""),
                    "Bridge connected"
                );
                *self.identity.write() = Some(identity);
                self.emit_qr(QrEvent::Success, true).await;
                self.emit(ProtocolEvent::Connected).await;
            }
            BridgeEvent::Timeout => self.emit_qr(QrEvent::Timeout, true).await,
            BridgeEvent::Message {
                id,
                from,
                chat,
                text,
                timestamp,
                from_me,
                raw,
            } => {
                let event = InboundEvent {
                    id,
                    chat_id: chat.unwrap_or_else(|| from.clone()),
                    sender_id: from,
                    text_body: text,
                    timestamp,
                    is_from_me: from_me,
                    raw_payload: raw,
                };
                self.emit(ProtocolEvent::Message(event)).await;
            }
            BridgeEvent::Result {
                request_id,
                ok,
                error,
            } => match self.pending.remove(&request_id) {
                Some((_, tx)) => {
                    let result = if ok {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| "request failed".to_string()))
                    };
                    let _ = tx.send(result);
                }
                None => debug!(request_id = %request_id, "Result for unknown request"),
            },
            BridgeEvent::LoggedOut => self.logged_out().await,
            BridgeEvent::Error { message } => error!("Bridge error: {message}"),
            BridgeEvent::Disconnected { reason } => {
                let reason = reason.unwrap_or_else(|| "unknown".to_string());
                if reason == "logged out" {
                    self.logged_out().await;
                } else {
                    warn!(reason = %reason, "Bridge disconnected");
                    self.emit(ProtocolEvent::Disconnected { reason }).await;
                }
            }
        }
    }

    async fn logged_out(&self) {
        self.identity.write().take();
        self.emit(ProtocolEvent::LoggedOut).await;
    }

    /// Fails every in-flight request and reports the bridge as gone.
    async fn bridge_exited(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err("bridge exited".to_string()));
            }
        }
        self.emit_qr(QrEvent::Error("bridge exited".to_string()), true)
            .await;
        self.emit(ProtocolEvent::Disconnected {
            reason: "bridge exited".to_string(),
        })
        .await;
    }
}

/// `628123:5@s.whatsapp.net` → `628123`.
fn phone_user(phone: &str) -> &str {
    let user = phone.split_once('@').map_or(phone, |(user, _)| user);
    user.split_once(':').map_or(user, |(user, _)| user)
}

// ─── BridgeClient ──────────────────────────────────────────

/// [`SessionClient`] driving a bridge subprocess.
pub struct BridgeClient {
    config: BridgeConfig,
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            child: tokio::sync::Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
        }
    }

    /// Checks that the Node.js executable runs.
    pub async fn check_runtime(&self) -> bool {
        Command::new(&self.config.node_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn spawn(&self) -> Result<(), ClientError> {
        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut()
            && matches!(child.try_wait(), Ok(None))
        {
            debug!("Bridge already running");
            return Ok(());
        }

        let session_dir = expand_tilde(&self.config.session_dir);
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(|e| ClientError::Connection(format!("session dir {session_dir}: {e}")))?;

        info!(
            bridge = %self.config.bridge_path,
            session_dir = %session_dir,
            "Starting bridge"
        );
        let mut child = Command::new(&self.config.node_bin)
            .arg(&self.config.bridge_path)
            .arg(&session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Connection(format!("failed to spawn bridge: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Connection("bridge stdout unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Connection("bridge stdin unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "bridge", "{line}");
                }
            });
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => shared.handle_line(&line).await,
                    Ok(None) => {
                        warn!("Bridge process exited");
                        break;
                    }
                    Err(e) => {
                        error!("Error reading bridge output: {e}");
                        break;
                    }
                }
            }
            shared.bridge_exited().await;
        });

        *self.stdin.lock().await = Some(stdin);
        *child_slot = Some(child);
        Ok(())
    }

    async fn write_command(&self, command: &BridgeCommand) -> Result<(), ClientError> {
        let mut line =
            serde_json::to_string(command).map_err(|e| ClientError::Transport(e.to_string()))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or(ClientError::Closed)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClientError::Transport(format!("bridge write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| ClientError::Transport(format!("bridge write failed: {e}")))
    }

    /// Sends a command and waits for its correlated result.
    async fn request(&self, request_id: String, command: BridgeCommand) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(request_id.clone(), tx);
        if let Err(e) = self.write_command(&command).await {
            self.shared.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(ClientError::Transport(message)),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                Err(ClientError::Timeout(self.config.request_timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl SessionClient for BridgeClient {
    async fn connect(&self) -> Result<(), ClientError> {
        self.spawn().await
    }

    fn is_authenticated(&self) -> bool {
        self.shared.identity.read().is_some()
    }

    fn current_identity(&self) -> Option<Identity> {
        self.shared.identity.read().clone()
    }

    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError> {
        let (tx, rx) = mpsc::channel(16);
        *self.shared.qr_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn send_text(&self, to: &Jid, text: &str) -> Result<(), ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let command = BridgeCommand::Send {
            request_id: request_id.clone(),
            to: to.to_string(),
            text: text.to_string(),
        };
        self.request(request_id, command).await
    }

    async fn logout(&self) -> Result<(), ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let command = BridgeCommand::Logout {
            request_id: request_id.clone(),
        };
        self.request(request_id, command).await?;
        self.shared.identity.write().take();
        Ok(())
    }

    async fn disconnect(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Bridge kill failed: {e}");
            }
            info!("Bridge stopped");
        }
    }

    fn set_event_sink(&self, sink: mpsc::Sender<ProtocolEvent>) {
        *self.shared.sink.lock() = Some(sink);
    }
}

/// Expands `~` at the start of a path to `$HOME`.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}{rest}")
    } else {
        path.to_string()
    }
}

// ─── Tests ─────────────────────────────────────────────────
