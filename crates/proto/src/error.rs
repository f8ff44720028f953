use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Gateway operation error.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Session client (protocol collaborator) error.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Device store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Errors surfaced by gateway operations.
///
/// The display strings double as the `error` field of HTTP error bodies.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Fatal startup problem (store open failure, restore connect failure).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation requires a logged-in session.
    #[error("not logged in")]
    NotAuthenticated,

    /// Login requested while a session is already active.
    #[error("already logged in")]
    AlreadyAuthenticated,

    /// Recipient could not be parsed as a JID.
    #[error("invalid JID")]
    InvalidRecipient { input: String },

    /// No active protocol session to send through.
    #[error("not connected")]
    NotConnected,

    /// Collaborator transport failure, carries its error text.
    #[error("{0}")]
    DeliveryFailed(String),

    /// Request body could not be decoded or was missing fields.
    #[error("{0}")]
    MalformedRequest(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

/// Session client (protocol collaborator) errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Collaborator could not be started or connected.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Collaborator reported a failure for a request.
    #[error("{0}")]
    Transport(String),

    /// Request was not answered in time.
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// Collaborator is gone.
    #[error("Session client closed")]
    Closed,
}

/// Device store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("server.port".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn gateway_error_messages_match_http_error_bodies() {
        let invalid = GatewayError::InvalidRecipient {
            input: "nope".to_string(),
        };
        assert_eq!(invalid.to_string(), "invalid JID");
        assert_eq!(GatewayError::NotAuthenticated.to_string(), "not logged in");
        assert_eq!(GatewayError::NotConnected.to_string(), "not connected");
        assert_eq!(
            GatewayError::DeliveryFailed("socket closed".to_string()).to_string(),
            "socket closed"
        );
    }

    #[test]
    fn store_error_becomes_configuration_error() {
        let err: GatewayError = StoreError::Sqlx("unable to open".to_string()).into();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert!(err.to_string().contains("unable to open"));
    }

    #[test]
    fn wraps_errors_into_top_level_error() {
        let gw: Error = GatewayError::NotConnected.into();
        assert!(gw.to_string().contains("Gateway error"));

        let client: Error = ClientError::Closed.into();
        assert!(client.to_string().contains("Client error"));

        let store: Error = StoreError::Migration("bad".to_string()).into();
        assert!(store.to_string().contains("Store error"));
    }
}
