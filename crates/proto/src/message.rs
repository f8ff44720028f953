use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Server part used for individual user accounts.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";

/// Authenticated user handle (the user part of the account JID, e.g. a phone number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    /// Returns the raw identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the identity string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Protocol address: `user[.agent][:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    /// User part (phone number, group id, ...).
    pub user: String,
    /// Optional agent suffix.
    pub agent: Option<u8>,
    /// Optional device suffix.
    pub device: Option<u16>,
    /// Server part (`s.whatsapp.net`, `g.us`, ...).
    pub server: String,
}

impl Jid {
    /// Builds a plain user JID on the default user server.
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            agent: None,
            device: None,
            server: DEFAULT_USER_SERVER.to_string(),
        }
    }

    /// Returns the identity this JID belongs to (device suffixes dropped).
    pub fn identity(&self) -> Identity {
        Identity(self.user.clone())
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user)?;
        if let Some(agent) = self.agent {
            write!(f, ".{agent}")?;
        }
        if let Some(device) = self.device {
            write!(f, ":{device}")?;
        }
        write!(f, "@{}", self.server)
    }
}

impl std::str::FromStr for Jid {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GatewayError::InvalidRecipient {
            input: s.to_string(),
        };
        let trimmed = s.trim();

        let Some((user_part, server)) = trimmed.split_once('@') else {
            // Bare phone number, optionally with a leading '+'.
            let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
            if (5..=20).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
                return Ok(Jid::user(digits));
            }
            return Err(invalid());
        };

        if !is_valid_server(server) {
            return Err(invalid());
        }

        let (user_agent, device) = match user_part.split_once(':') {
            Some((rest, device)) => (rest, Some(device.parse::<u16>().map_err(|_| invalid())?)),
            None => (user_part, None),
        };
        let (user, agent) = match user_agent.split_once('.') {
            Some((user, agent)) => (user, Some(agent.parse::<u8>().map_err(|_| invalid())?)),
            None => (user_agent, None),
        };

        if user.is_empty()
            || !user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }

        Ok(Jid {
            user: user.to_string(),
            agent,
            device,
            server: server.to_string(),
        })
    }
}

fn is_valid_server(server: &str) -> bool {
    !server.is_empty()
        && !server.starts_with('.')
        && !server.ends_with('.')
        && !server.contains("..")
        && server
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.')
}
