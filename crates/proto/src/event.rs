use serde::{Deserialize, Serialize};

/// One inbound message notification from the protocol session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Protocol message id.
    #[serde(default)]
    pub id: String,
    /// Sender JID as reported by the protocol.
    pub sender_id: String,
    /// Chat the message was posted in (equals the sender for direct chats).
    #[serde(default)]
    pub chat_id: String,
    /// Plain conversation text, empty for media/structured messages.
    #[serde(default)]
    pub text_body: String,
    /// Message timestamp in unix seconds.
    pub timestamp: i64,
    /// Whether this is an echo of our own outbound message.
    #[serde(default)]
    pub is_from_me: bool,
    /// Full protocol payload as reported by the session client.
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

impl InboundEvent {
    /// Creates a text event with an empty raw payload.
    pub fn text(sender_id: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        let sender_id = sender_id.into();
        Self {
            id: String::new(),
            chat_id: sender_id.clone(),
            sender_id,
            text_body: text.into(),
            timestamp,
            is_from_me: false,
            raw_payload: serde_json::Value::Null,
        }
    }

    /// User part of the sender JID (`628123@s.whatsapp.net` → `628123`).
    pub fn sender_user(&self) -> &str {
        let before_server = self
            .sender_id
            .split_once('@')
            .map_or(self.sender_id.as_str(), |(user, _)| user);
        let before_device = before_server
            .split_once(':')
            .map_or(before_server, |(user, _)| user);
        before_device
            .split_once('.')
            .map_or(before_device, |(user, _)| user)
    }

    /// `false` for events with empty text and no structured payload.
    pub fn has_content(&self) -> bool {
        if !self.text_body.is_empty() {
            return true;
        }
        match &self.raw_payload {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

/// Compact push payload: `{from, message, time}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Sender JID.
    pub from: String,
    /// Conversation text.
    pub message: String,
    /// Unix seconds.
    pub time: i64,
}

impl From<&InboundEvent> for PushMessage {
    fn from(event: &InboundEvent) -> Self {
        Self {
            from: event.sender_id.clone(),
            message: event.text_body.clone(),
            time: event.timestamp,
        }
    }
}

/// Shape of the payload delivered to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// `{from, message, time}` without normalization.
    #[default]
    Simple,
    /// The full event, run through the base64-aware normalizer.
    Rich,
}
