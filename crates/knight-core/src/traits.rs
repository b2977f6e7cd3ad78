use crate::{
    error::KnightError,
    event::{
        ChatMessage, CredentialRecord, GroupMetadata, InboundEvent, MediaRef, OutgoingMessage,
        ParticipantAction, ParticipantsUpdate, Presence,
    },
};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything the protocol client needs to open one transport.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Hostname of the remote service (TLS server name).
    pub host: String,
    /// Address the facade resolved `host` to.
    pub address: Ipv4Addr,
    pub port: u16,
    /// Stored credentials, `None` for a fresh pairing.
    pub credentials: Option<CredentialRecord>,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
}

/// A freshly opened transport plus its inbound event stream.
///
/// The stream ends when the transport is gone.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<InboundEvent>,
}

/// Protocol client: the external library that speaks WhatsApp Web.
///
/// Implementations own encryption, framing, and pairing. The lifecycle
/// manager only asks for a connection and watches the events it yields.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Human-readable client name.
    fn name(&self) -> &str;

    /// Open a transport to the service.
    async fn connect(&self, params: ConnectParams) -> Result<Connection, KnightError>;
}

/// A live connection handle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message.
    async fn send(&self, message: OutgoingMessage) -> Result<(), KnightError>;

    /// No-op round trip used as a liveness probe. Resolves once the remote
    /// side acknowledged it.
    async fn probe(&self) -> Result<(), KnightError>;

    /// Request a graceful close.
    async fn close(&self) -> Result<(), KnightError>;

    /// Set a presence indicator in a chat.
    async fn presence(&self, _chat_id: &str, _presence: Presence) -> Result<(), KnightError> {
        Ok(())
    }

    /// Fetch group metadata (participants and admin flags).
    async fn group_metadata(&self, group_id: &str) -> Result<GroupMetadata, KnightError>;

    /// Add, remove, promote, or demote group participants.
    async fn update_participants(
        &self,
        group_id: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), KnightError>;

    /// Download and decrypt media referenced by a message.
    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, KnightError>;

    /// The bot's own JID, once known.
    fn own_id(&self) -> Option<String>;
}

/// Chat feature handler (stickers, canned replies, moderation).
///
/// Handlers are expected to contain their own errors, but the dispatcher
/// isolates every call regardless.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name, used in logs.
    fn name(&self) -> &str;

    /// Handle a single upserted message.
    async fn on_message(
        &self,
        _transport: Arc<dyn Transport>,
        _message: &ChatMessage,
    ) -> Result<(), KnightError> {
        Ok(())
    }

    /// Handle a group membership change.
    async fn on_participants(
        &self,
        _transport: Arc<dyn Transport>,
        _update: &ParticipantsUpdate,
    ) -> Result<(), KnightError> {
        Ok(())
    }
}
