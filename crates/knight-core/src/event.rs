//! Inbound events and outbound messages exchanged with the protocol client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque authentication state issued by the remote service.
///
/// This layer never looks inside; it only encrypts, persists, and hands it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRecord(pub serde_json::Value);

/// Why the transport closed.
///
/// Numeric codes follow the status codes the WhatsApp-Web ecosystem reports
/// on disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    TimedOut,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    Unavailable,
    RestartRequired,
    Other(u16),
    /// Socket-level failure with no protocol status attached.
    Transport(String),
}

impl DisconnectReason {
    /// Map a protocol status code to a reason.
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::Unavailable,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    /// Protocol status code, if the reason carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::Forbidden => Some(403),
            Self::ConnectionLost | Self::TimedOut => Some(408),
            Self::MultideviceMismatch => Some(411),
            Self::ConnectionClosed => Some(428),
            Self::ConnectionReplaced => Some(440),
            Self::BadSession => Some(500),
            Self::Unavailable => Some(503),
            Self::RestartRequired => Some(515),
            Self::Other(code) => Some(*code),
            Self::Transport(_) => None,
        }
    }

    /// Terminal reasons cannot be fixed by reconnecting.
    ///
    /// A replaced connection means another client took over the session;
    /// reconnecting would only start a tug-of-war with it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut
                | Self::Forbidden
                | Self::BadSession
                | Self::MultideviceMismatch
                | Self::ConnectionReplaced
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport failure: {detail}"),
            Self::Other(code) => write!(f, "status {code}"),
            other => {
                let name = serde_json::to_value(other)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                match other.status_code() {
                    Some(code) => write!(f, "{name} ({code})"),
                    None => write!(f, "{name}"),
                }
            }
        }
    }
}

/// Connection status reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "connection", content = "reason", rename_all = "snake_case")]
pub enum ConnectionUpdate {
    Connecting,
    Open,
    Close(DisconnectReason),
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

/// Reference to downloadable media; `handle` is opaque to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    #[serde(default)]
    pub mimetype: Option<String>,
    pub handle: String,
}

/// The message a chat message replies to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotedMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

/// An inbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// Chat JID (`...@s.whatsapp.net` or `...@g.us`).
    pub chat_id: String,
    /// Author JID. Equals `chat_id` in direct chats.
    pub sender_id: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub quoted: Option<Box<QuotedMessage>>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Whether this message was posted in a group chat.
    pub fn is_group(&self) -> bool {
        self.chat_id.ends_with("@g.us")
    }

    /// Message text or media caption, empty if none.
    pub fn body(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// What happened to a set of group participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// Membership change in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsUpdate {
    pub group_id: String,
    pub participants: Vec<String>,
    pub action: ParticipantAction,
}

/// Everything the protocol client can report to the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    ConnectionUpdate(ConnectionUpdate),
    CredentialsUpdate(CredentialRecord),
    MessagesUpsert(Vec<ChatMessage>),
    GroupParticipantsUpdate(ParticipantsUpdate),
    /// QR payload to scan for first-time pairing.
    PairingCode(String),
}

/// Body of an outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutgoingContent {
    Text { text: String },
    Sticker {
        #[serde(with = "base64_bytes")]
        webp: Vec<u8>,
    },
    /// Revoke a message for everyone.
    Delete {
        message_id: String,
        #[serde(default)]
        participant: Option<String>,
    },
}

/// A message the bot sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub content: OutgoingContent,
    /// ID of the message being replied to.
    #[serde(default)]
    pub quoted: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl OutgoingMessage {
    /// Plain text message.
    pub fn text(chat_id: &str, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            content: OutgoingContent::Text { text: text.into() },
            quoted: None,
            mentions: Vec::new(),
        }
    }

    /// Sticker message from WebP bytes.
    pub fn sticker(chat_id: &str, webp: Vec<u8>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            content: OutgoingContent::Sticker { webp },
            quoted: None,
            mentions: Vec::new(),
        }
    }

    /// Revoke an existing message.
    pub fn delete(chat_id: &str, message_id: &str, participant: Option<&str>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            content: OutgoingContent::Delete {
                message_id: message_id.to_string(),
                participant: participant.map(str::to_string),
            },
            quoted: None,
            mentions: Vec::new(),
        }
    }

    pub fn quoting(mut self, message_id: &str) -> Self {
        self.quoted = Some(message_id.to_string());
        self
    }

    pub fn mentioning(mut self, jid: &str) -> Self {
        self.mentions.push(jid.to_string());
        self
    }
}

/// Chat presence indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Composing,
    Paused,
    Available,
}

/// A group participant as reported by group metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: String,
    #[serde(default)]
    pub admin: bool,
}

/// Group metadata needed for moderation decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    pub participants: Vec<GroupParticipant>,
}

impl GroupMetadata {
    /// Whether `jid` is an admin of this group.
    pub fn is_admin(&self, jid: &str) -> bool {
        self.participants.iter().any(|p| p.id == jid && p.admin)
    }
}

/// Serde adapter carrying binary payloads as base64 strings in JSON.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Strip the device suffix from a JID (`123:4@s.whatsapp.net` → `123@s.whatsapp.net`).
pub fn normalize_jid(jid: &str) -> String {
    let (user, server) = jid.split_once('@').unwrap_or((jid, "s.whatsapp.net"));
    let user = user.split(':').next().unwrap_or(user);
    format!("{user}@{server}")
}

/// User part of a JID, used for `@mentions` in text.
pub fn jid_user(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}
