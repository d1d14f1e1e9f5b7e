//! Channel contract: inbound message shape, outbound send port, and the error
//! taxonomy shared by every transport.
//!
//! The pairing guard and the privileged command parser live here too because
//! they are transport-independent.

pub mod commands;
pub mod pairing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// An inbound chat message, already unwrapped from the transport's envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel name (e.g. `"whatsapp"`).
    pub channel: String,
    /// Stable sender identity used for whitelisting and pairing.
    pub sender: String,
    /// Address replies should go to.
    pub reply_to: String,
    /// Message text.
    pub text: String,
    /// Whether the conversation is a group chat.
    pub is_group: bool,
    /// Whether the message was sent by the linked account itself.
    pub from_me: bool,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

/// Errors surfaced by a channel send.
///
/// Only [`ChannelError::InvalidRecipient`] is permanent; everything else can
/// heal by waiting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Network or socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// No open connection right now.
    #[error("not connected")]
    NotConnected,

    /// The recipient can never receive a direct message.
    #[error("invalid recipient {recipient:?}: {reason}")]
    InvalidRecipient {
        /// The rejected address as given.
        recipient: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The linked session was invalidated and needs re-authentication.
    #[error("session terminated; re-link the device")]
    SessionTerminated,
}

impl ChannelError {
    /// Whether retrying can never succeed (poison message).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidRecipient { .. })
    }
}

/// Outbound send capability consumed by the outbox.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send `text` to `user_id`.
    async fn send_message(&self, user_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Whether a send right now has a chance of succeeding.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Generic start/stop/send contract implemented by each messaging channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name, also used as the outbox/whitelist partition key.
    fn name(&self) -> &str;

    /// Connect and start processing inbound messages and the outbox.
    async fn start(&self) -> anyhow::Result<()>;

    /// Send a message immediately, bypassing the outbox.
    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Disconnect and stop all background work.
    async fn stop(&self);
}
