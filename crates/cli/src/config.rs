use std::path::{Path, PathBuf};
use std::time::Duration;

use channels::{BridgeConfig, HttpConfig};
use gateway::{DispatchPolicy, WebhookSettings};
use proto::{ConfigError, PayloadFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP API listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Bridge subprocess.
    #[serde(default)]
    pub bridge: BridgeSection,

    /// Device store.
    #[serde(default)]
    pub store: StoreConfig,

    /// QR login behaviour.
    #[serde(default)]
    pub login: LoginConfig,

    /// Webhook fan-out.
    #[serde(default)]
    pub webhooks: WebhooksConfig,

    /// WebSocket push payloads.
    #[serde(default)]
    pub push: PushConfig,

    /// Event filtering.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Seconds to wait for in-flight webhook deliveries on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bridge: BridgeSection::default(),
            store: StoreConfig::default(),
            login: LoginConfig::default(),
            webhooks: WebhooksConfig::default(),
            push: PushConfig::default(),
            dispatch: DispatchConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

/// HTTP API config.
///
/// Environment overrides: `WAGATE_PORT`, `WAGATE_API_TOKEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required by every route except `/health`. Empty = open.
    #[serde(default)]
    pub api_token: String,
    /// Allowed CORS origins (comma-separated), `*` for any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origins() -> String {
    "*".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: String::new(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Bridge subprocess config.
///
/// Environment overrides: `WAGATE_SESSION_DIR`, `WAGATE_BRIDGE_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_node_bin")]
    pub node_bin: String,
    #[serde(default = "default_bridge_path")]
    pub bridge_path: String,
    /// Directory for the bridge's session credentials.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_node_bin() -> String {
    "node".to_string()
}

fn default_bridge_path() -> String {
    "whatsapp-bridge/index.js".to_string()
}

fn default_session_dir() -> String {
    format!("{}/.wagate/session", home_dir())
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            node_bin: default_node_bin(),
            bridge_path: default_bridge_path(),
            session_dir: default_session_dir(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Device store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file path.
    #[serde(default = "default_store_url")]
    pub url: String,
}

fn default_store_url() -> String {
    format!("{}/.wagate/devices.db", home_dir())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

/// QR login config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Where the current QR PNG is written.
    #[serde(default = "default_qr_file")]
    pub qr_file: String,
    /// QR rounds before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Also print each QR code to the terminal.
    #[serde(default = "default_print_qr")]
    pub print_qr: bool,
}

fn default_qr_file() -> String {
    "qr.png".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_print_qr() -> bool {
    true
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            qr_file: default_qr_file(),
            max_attempts: default_max_attempts(),
            print_qr: default_print_qr(),
        }
    }
}

/// Webhook config.
///
/// Environment overrides: `WAGATE_WEBHOOKS` (comma-separated),
/// `WAGATE_WEBHOOK_SECRET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    /// URLs registered at startup.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// HMAC-SHA256 signing secret. Empty = unsigned.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_webhook_format")]
    pub format: PayloadFormat,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    256
}

fn default_webhook_format() -> PayloadFormat {
    PayloadFormat::Rich
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            timeout_secs: default_webhook_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            secret: String::new(),
            format: default_webhook_format(),
        }
    }
}

/// WebSocket push config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub format: PayloadFormat,
}

/// Event filtering config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Drop messages with no text and no structured payload.
    #[serde(default)]
    pub skip_empty: bool,
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            // Look in current dir, then home dir
            let cwd = std::env::current_dir().ok()?.join("config.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".wagate").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };
        config.apply_env()?;
        config.validate()?;

        debug!(
            port = config.server.port,
            webhooks = config.webhooks.urls.len(),
            store = %config.store.url,
            "Config loaded"
        );
        Ok(config)
    }

    /// Environment variable overrides.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("WAGATE_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "WAGATE_PORT".to_string(),
                reason: format!("not a port number: {port}"),
            })?;
        }
        if let Ok(token) = std::env::var("WAGATE_API_TOKEN") {
            self.server.api_token = token;
        }
        if let Ok(urls) = std::env::var("WAGATE_WEBHOOKS") {
            self.webhooks.urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(secret) = std::env::var("WAGATE_WEBHOOK_SECRET") {
            self.webhooks.secret = secret;
        }
        if let Ok(dir) = std::env::var("WAGATE_SESSION_DIR") {
            self.bridge.session_dir = dir;
        }
        if let Ok(bridge) = std::env::var("WAGATE_BRIDGE_PATH") {
            self.bridge.bridge_path = bridge;
        }
        if let Ok(url) = std::env::var("WAGATE_DB_URL") {
            self.store.url = url;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.url.trim().is_empty() {
            return Err(ConfigError::MissingField("store.url".to_string()));
        }
        if self.bridge.bridge_path.trim().is_empty() {
            return Err(ConfigError::MissingField("bridge.bridge_path".to_string()));
        }
        if self.login.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "login.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(url) = self
            .webhooks
            .urls
            .iter()
            .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(ConfigError::InvalidValue {
                field: "webhooks.urls".to_string(),
                reason: format!("not an http(s) URL: {url}"),
            });
        }
        Ok(())
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            node_bin: self.bridge.node_bin.clone(),
            bridge_path: self.bridge.bridge_path.clone(),
            session_dir: self.bridge.session_dir.clone(),
            request_timeout: Duration::from_secs(self.bridge.request_timeout_secs),
        }
    }

    pub fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings {
            timeout: Duration::from_secs(self.webhooks.timeout_secs),
            max_in_flight: self.webhooks.max_in_flight,
            secret: Some(self.webhooks.secret.clone()).filter(|s| !s.is_empty()),
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            skip_empty: self.dispatch.skip_empty,
            push_format: self.push.format,
            webhook_format: self.webhooks.format,
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            api_token: Some(self.server.api_token.clone()).filter(|t| !t.is_empty()),
            cors_origins: self.server.cors_origins.clone(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Base URL a local client uses to reach the running gateway.
    pub fn api_base_url(&self) -> String {
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "[::1]",
            other => other,
        };
        format!("http://{host}:{}", self.server.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{set_env_var, with_locked_env};

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, content).expect("write config");
        path
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.cors_origins, "*");
        assert!(cfg.server.api_token.is_empty());
        assert_eq!(cfg.bridge.node_bin, "node");
        assert_eq!(cfg.login.max_attempts, 5);
        assert_eq!(cfg.webhooks.format, PayloadFormat::Rich);
        assert_eq!(cfg.push.format, PayloadFormat::Simple);
        assert!(!cfg.dispatch.skip_empty);
        assert!(cfg.store.url.ends_with(".wagate/devices.db"));
    }

    #[test]
    fn load_reads_toml_sections() {
        with_locked_env(|| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = write_config(
                tmp.path(),
                r#"
shutdown_grace_secs = 2

[server]
port = 9000
api_token = "tok"

[webhooks]
urls = ["https://example.com/a"]
secret = "s"
format = "simple"

[push]
format = "rich"

[dispatch]
skip_empty = true
"#,
            );
            let cfg = Config::load(Some(&path)).expect("load");
            assert_eq!(cfg.server.port, 9000);
            assert_eq!(cfg.server.host, "0.0.0.0");
            assert_eq!(cfg.webhooks.urls, ["https://example.com/a"]);
            assert_eq!(cfg.shutdown_grace(), Duration::from_secs(2));

            let policy = cfg.dispatch_policy();
            assert!(policy.skip_empty);
            assert_eq!(policy.push_format, PayloadFormat::Rich);
            assert_eq!(policy.webhook_format, PayloadFormat::Simple);
            assert_eq!(cfg.webhook_settings().secret.as_deref(), Some("s"));
            assert_eq!(cfg.http_config().api_token.as_deref(), Some("tok"));
        });
    }

    #[test]
    fn env_overrides_take_priority() {
        with_locked_env(|| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = write_config(tmp.path(), "[server]\nport = 9000\n");
            set_env_var("WAGATE_PORT", "9100");
            set_env_var("WAGATE_API_TOKEN", "env-token");
            set_env_var("WAGATE_WEBHOOKS", "http://a, ,https://b");
            set_env_var("WAGATE_DB_URL", "/tmp/wagate-test.db");

            let cfg = Config::load(Some(&path)).expect("load");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.server.api_token, "env-token");
            assert_eq!(cfg.webhooks.urls, ["http://a", "https://b"]);
            assert_eq!(cfg.store.url, "/tmp/wagate-test.db");
        });
    }

    #[test]
    fn invalid_port_env_is_rejected() {
        with_locked_env(|| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = write_config(tmp.path(), "");
            set_env_var("WAGATE_PORT", "eighty");
            let err = Config::load(Some(&path)).expect_err("bad port");
            assert!(matches!(err, ConfigError::InvalidValue { .. }));
        });
    }

    #[test]
    fn validate_rejects_non_http_webhooks_and_zero_attempts() {
        let mut cfg = Config::default();
        cfg.webhooks.urls = vec!["ftp://x".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.login.max_attempts = 0;
        assert!(cfg.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        with_locked_env(|| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = write_config(tmp.path(), "[store]\n\n[login]\nprint_qr = false\n");
            let cfg = Config::load(Some(&path)).expect("load");
            assert_eq!(cfg.store.url, StoreConfig::default().url);
            assert!(cfg.store.url.ends_with(".wagate/devices.db"));
            assert!(!cfg.login.print_qr);
            assert_eq!(cfg.login.max_attempts, 5);
        });
    }

    #[test]
    fn malformed_toml_is_a_toml_error() {
        with_locked_env(|| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = write_config(tmp.path(), "[server\nport = 1");
            assert!(matches!(
                Config::load(Some(&path)),
                Err(ConfigError::Toml(_))
            ));
        });
    }

    #[test]
    fn api_base_url_maps_wildcard_host_to_loopback() {
        let mut cfg = Config::default();
        assert_eq!(cfg.api_base_url(), "http://127.0.0.1:8080");
        cfg.server.host = "10.0.0.5".to_string();
        cfg.server.port = 9000;
        assert_eq!(cfg.api_base_url(), "http://10.0.0.5:9000");
        assert_eq!(cfg.listen_addr(), "10.0.0.5:9000");
    }
}
