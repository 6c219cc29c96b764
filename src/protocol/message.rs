//! Application message model.
//!
//! Every envelope plaintext is one UTF-8 JSON object with a required `type`
//! tag, a 32-hex-char `id` for user-visible messages, and free-form
//! type-specific fields. Unknown fields are preserved verbatim so newer
//! clients can ride through older servers.
//!
//! Messages are immutable once sent; the server only ever stamps `sender`
//! before routing.

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::{ChatError, Result};

/// Closed set of application message types.
///
/// Receive dispatch is a match on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Chat text routed point-to-point or broadcast
    Text,
    /// Image transfer control; payload bytes are opaque to the server
    Image,
    /// File transfer control
    File,
    /// Audio transfer control
    Audio,
    /// Video transfer control
    Video,
    /// Server/client control plane (probes, rekey exchange)
    System,
    /// Typing indicator, debounced before fan-out
    Typing,
    /// Read receipt forwarded to the original sender
    ReadReceipt,
    /// Delivery acknowledgement correlated by message id
    Delivery,
    /// Credential presentation and response
    Auth,
    /// Directory snapshot request/reply
    UserList,
    /// Single-user presence lookup
    UserStatus,
    /// Error report; log-only when inbound
    Error,
}

impl MessageKind {
    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Audio => "audio",
            MessageKind::Video => "video",
            MessageKind::System => "system",
            MessageKind::Typing => "typing",
            MessageKind::ReadReceipt => "read_receipt",
            MessageKind::Delivery => "delivery",
            MessageKind::Auth => "auth",
            MessageKind::UserList => "user_list",
            MessageKind::UserStatus => "user_status",
            MessageKind::Error => "error",
        }
    }

    /// Whether messages of this kind are user-visible content that requires
    /// an id and a delivery acknowledgement.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            MessageKind::Text
                | MessageKind::Image
                | MessageKind::File
                | MessageKind::Audio
                | MessageKind::Video
        )
    }
}

/// One application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message type tag
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// 32-hex-char message id; present on user-visible messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Authenticated username of the originator (server-populated on routing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Target username; empty or absent means broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// Text content for chat messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Submission time, unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,

    /// Type-specific and unknown fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Create a message of the given kind stamped with the current time.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            id: None,
            sender: None,
            recipient: None,
            content: None,
            ts: Some(unix_millis()),
            extra: Map::new(),
        }
    }

    /// Attach a fresh random message id.
    pub fn with_new_id(mut self) -> Self {
        self.id = Some(new_message_id());
        self
    }

    /// Set an extra field.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Build a delivery status frame for the given message id.
    pub fn delivery(id: &str, status: &str) -> Self {
        Self::new(MessageKind::Delivery)
            .with_field("status", Value::String(status.to_string()))
            .with_id_str(id)
    }

    /// Build an outbound error frame.
    pub fn error_frame(code: &str, detail: impl Into<String>) -> Self {
        Self::new(MessageKind::Error)
            .with_field("code", Value::String(code.to_string()))
            .with_field("detail", Value::String(detail.into()))
    }

    /// Build a system control frame carrying an `action` discriminator.
    pub fn system(action: &str) -> Self {
        Self::new(MessageKind::System).with_field("action", Value::String(action.to_string()))
    }

    /// Build a successful auth response carrying the issued token.
    pub fn auth_ok(token: &str) -> Self {
        Self::new(MessageKind::Auth)
            .with_field("ok", Value::Bool(true))
            .with_field("token", Value::String(token.to_string()))
    }

    /// Build a failed auth response.
    pub fn auth_failed(reason: &str) -> Self {
        Self::new(MessageKind::Auth)
            .with_field("ok", Value::Bool(false))
            .with_field("error", Value::String(reason.to_string()))
    }

    fn with_id_str(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// String extra field, if present.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Boolean extra field, if present.
    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }

    /// Whether this is user-visible content requiring an id and delivery
    /// tracking.
    pub fn is_user_visible(&self) -> bool {
        self.kind.is_user_visible()
    }

    /// Whether the message targets everyone (no recipient, or empty).
    pub fn is_broadcast(&self) -> bool {
        match &self.recipient {
            None => true,
            Some(r) => r.is_empty(),
        }
    }

    /// Serialize to the envelope plaintext.
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ChatError::DecodeError(format!(
                "encoded message of {} bytes exceeds maximum {MAX_MESSAGE_SIZE}",
                bytes.len()
            )));
        }
        Ok(Bytes::from(bytes))
    }

    /// Parse an envelope plaintext.
    ///
    /// Failures here are recoverable: the peer is informed with an error
    /// frame and the connection stays up.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ChatError::DecodeError(format!(
                "message of {} bytes exceeds maximum {MAX_MESSAGE_SIZE}",
                bytes.len()
            )));
        }
        let msg: ChatMessage = serde_json::from_slice(bytes)
            .map_err(|e| ChatError::DecodeError(format!("invalid message JSON: {e}")))?;
        msg.check_id()?;
        Ok(msg)
    }

    /// User-visible messages must carry a well-formed id.
    fn check_id(&self) -> Result<()> {
        if self.is_user_visible() {
            match &self.id {
                Some(id) if is_valid_message_id(id) => Ok(()),
                Some(id) => Err(ChatError::DecodeError(format!(
                    "malformed message id '{id}'"
                ))),
                None => Err(ChatError::DecodeError(format!(
                    "{} message without id",
                    self.kind.as_str()
                ))),
            }
        } else {
            Ok(())
        }
    }
}

/// Generate a fresh 128-bit message id rendered as 32 hex characters.
pub fn new_message_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Check the 32-lowercase-hex message id shape.
pub fn is_valid_message_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Current time as unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
