//! WhatsApp channel: bridge client, event stream, connection lifecycle,
//! sidecar setup, and the channel adapter.
//!
//! Talks to a baileys-based Docker sidecar (`hearth-whatsapp`) over HTTP on
//! port 3001, with long-polling for real-time events.

pub mod adapter;
pub mod client;
pub mod connection;
pub mod events;
pub mod jid;
pub mod setup;
pub mod transport;

use crate::channel::ChannelError;

/// Errors from the bridge client and sidecar lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum WhatsAppError {
    /// HTTP request to the sidecar failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The sidecar container is not running or not reachable.
    #[error("sidecar not running")]
    SidecarNotRunning,

    /// The bridge answered a request with a non-success status.
    #[error("bridge rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// Container setup or lifecycle operation failed.
    #[error("setup failed: {0}")]
    SetupFailed(String),
}

impl WhatsAppError {
    /// Classify for the channel layer. `recipient` is the address the failed
    /// request targeted.
    pub fn into_channel_error(self, recipient: &str) -> ChannelError {
        match self {
            Self::Rejected { status, body } => match status {
                400 | 404 | 422 => ChannelError::InvalidRecipient {
                    recipient: recipient.to_owned(),
                    reason: body,
                },
                401 => ChannelError::SessionTerminated,
                409 | 503 => ChannelError::NotConnected,
                _ => ChannelError::Transport(format!("bridge returned {status}: {body}")),
            },
            other => ChannelError::Transport(other.to_string()),
        }
    }
}
