//! Bridge event stream and its mapping onto connection-level events.
//!
//! Connects to the sidecar's `/events/poll` long-polling endpoint and forwards
//! events to the Connection Manager via an mpsc channel. The listener never
//! retries on its own: a broken stream becomes a [`CloseReason::StreamErrored`]
//! and reconnect policy stays with the Connection Manager.

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::jid::{Jid, JidKind};
use crate::channel::InboundMessage;

/// Channel name stamped on inbound messages.
pub const CHANNEL_NAME: &str = "whatsapp";

/// Bridge status code for a session invalidated by the phone (logged out).
pub const STATUS_LOGGED_OUT: u16 = 401;

/// Bridge status code asking the client to open a fresh socket.
pub const STATUS_RESTART_REQUIRED: u16 = 515;

/// Long-poll timeout for the HTTP client (seconds).
const POLL_TIMEOUT_SECS: u64 = 60;

/// Pause after a non-200 poll response (seconds).
const NON_OK_PAUSE_SECS: u64 = 5;

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Credentials were invalidated; do not reconnect.
    LoggedOut,
    /// The server asked for a fresh socket.
    RestartRequired,
    /// The event stream broke (network error, sidecar restart).
    StreamErrored(String),
    /// Any other close reported by the bridge.
    Closed {
        /// Bridge status code, if reported.
        status_code: Option<u16>,
        /// Human-readable reason, if reported.
        reason: Option<String>,
    },
}

impl CloseReason {
    /// Classify a bridge `disconnected` event.
    pub fn from_bridge(status_code: Option<u16>, reason: Option<String>) -> Self {
        let logged_out_text = reason
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("logged_out") || r.eq_ignore_ascii_case("loggedout"));
        match status_code {
            Some(STATUS_LOGGED_OUT) => Self::LoggedOut,
            _ if logged_out_text => Self::LoggedOut,
            Some(STATUS_RESTART_REQUIRED) => Self::RestartRequired,
            _ => Self::Closed {
                status_code,
                reason,
            },
        }
    }

    /// Whether this close ends the session for good.
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// Connection-level event consumed by the Connection Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The handshake started.
    Connecting,
    /// The connection is open and usable.
    Open,
    /// The connection closed.
    Close(CloseReason),
    /// The device is unlinked; this QR payload links it.
    Qr(String),
    /// An inbound chat message.
    Message(InboundMessage),
}

/// Raw event as served by the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A new message was received (or sent by us).
    Message {
        /// WhatsApp JID of the conversation.
        jid: String,
        /// Participant JID for group messages.
        #[serde(default)]
        sender: Option<String>,
        /// Message text content.
        text: String,
        /// Whether this message was sent by us.
        #[serde(default)]
        from_me: bool,
        /// Bridge-assigned message identifier.
        #[serde(default)]
        message_id: Option<String>,
    },
    /// The socket is performing its handshake.
    Connecting,
    /// WhatsApp connection established.
    Connected,
    /// WhatsApp connection lost.
    Disconnected {
        /// Human-readable reason, if available.
        #[serde(default)]
        reason: Option<String>,
        /// Disconnect status code, if available.
        #[serde(default)]
        status_code: Option<u16>,
    },
    /// A QR code is waiting to be scanned.
    Qr {
        /// Raw QR payload.
        code: String,
    },
}

impl BridgeEvent {
    /// Map onto a [`TransportEvent`]. Messages without a parseable chat JID
    /// are dropped.
    pub fn into_transport(self) -> Option<TransportEvent> {
        match self {
            Self::Connecting => Some(TransportEvent::Connecting),
            Self::Connected => Some(TransportEvent::Open),
            Self::Disconnected {
                reason,
                status_code,
            } => Some(TransportEvent::Close(CloseReason::from_bridge(
                status_code,
                reason,
            ))),
            Self::Qr { code } => Some(TransportEvent::Qr(code)),
            Self::Message {
                jid,
                sender,
                text,
                from_me,
                message_id,
            } => {
                let chat = match Jid::parse(&jid) {
                    Ok(chat) => chat,
                    Err(e) => {
                        debug!(jid, ?message_id, error = %e, "dropping message with bad chat JID");
                        return None;
                    }
                };
                let is_group = chat.kind() == JidKind::Group;
                let sender_id = sender
                    .as_deref()
                    .and_then(|s| Jid::parse(s).ok())
                    .map(|s| s.user().to_owned())
                    .unwrap_or_else(|| chat.user().to_owned());
                Some(TransportEvent::Message(InboundMessage {
                    channel: CHANNEL_NAME.to_owned(),
                    sender: sender_id,
                    reply_to: chat.to_string(),
                    text,
                    is_group,
                    from_me,
                    received_at: Utc::now(),
                }))
            }
        }
    }
}

/// Spawn the event listener for one socket.
///
/// Forwards bridge events in order. Ends after emitting a close on stream
/// failure, or silently when the receiver is dropped. Abort the handle to
/// close the socket.
pub fn spawn_event_listener(
    base_url: String,
    event_tx: mpsc::Sender<TransportEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poll_url = format!("{base_url}/events/poll");
        info!(url = %poll_url, "connecting to WhatsApp event stream");
        if let Err(e) = poll_events(&poll_url, &event_tx).await {
            warn!(error = %e, "WhatsApp event stream failed");
            let close = TransportEvent::Close(CloseReason::StreamErrored(e.to_string()));
            let _ = event_tx.send(close).await;
        }
    })
}

/// Poll the sidecar for events until the receiver is dropped. Returns `Err`
/// on non-timeout network errors.
async fn poll_events(
    poll_url: &str,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> Result<(), reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SECS))
        .build()?;

    loop {
        match client.get(poll_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let events = match resp.json::<Vec<BridgeEvent>>().await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "undecodable event batch from bridge");
                        continue;
                    }
                };
                for event in events.into_iter().filter_map(BridgeEvent::into_transport) {
                    if event_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(std::time::Duration::from_secs(NON_OK_PAUSE_SECS)).await;
            }
            // Long-poll timeout expired with nothing to report.
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        }
    }
}
