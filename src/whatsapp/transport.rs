//! Transport seam between the Connection Manager and the wire.
//!
//! [`Transport::connect`] performs one handshake and hands back a [`Socket`]
//! plus its event stream. The Connection Manager is the only caller.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::client::WhatsAppClient;
use super::events::{spawn_event_listener, TransportEvent};
use super::jid::Jid;
use crate::channel::ChannelError;

/// Event buffer per socket.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One live transport session.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send a text message.
    async fn send_text(&self, to: &Jid, text: &str) -> Result<(), ChannelError>;

    /// Show a typing indicator. Best effort.
    async fn send_typing(&self, _to: &Jid) {}

    /// Force-close the session. Idempotent.
    fn close(&self);
}

/// Result of a successful handshake.
pub struct TransportSession {
    /// The new socket.
    pub socket: Arc<dyn Socket>,
    /// Events for this socket, in order.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

/// Opens transport sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a handshake and return the new session.
    async fn connect(&self) -> Result<TransportSession, ChannelError>;
}

/// Transport backed by the bridge sidecar's HTTP API.
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    client: WhatsAppClient,
}

impl BridgeTransport {
    /// Create a transport for the given bridge client.
    pub fn new(client: WhatsAppClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self) -> Result<TransportSession, ChannelError> {
        // The sidecar owns the WhatsApp credentials; reaching it is the handshake.
        let status = self.client.status().await.map_err(|e| {
            ChannelError::Transport(format!(
                "bridge at {} is not reachable: {e}",
                self.client.base_url()
            ))
        })?;

        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // A bridge that is already linked will not announce `connected` again.
        let mut initial = vec![TransportEvent::Connecting];
        if status.connected {
            initial.push(TransportEvent::Open);
        }
        for event in initial {
            if event_tx.try_send(event).is_err() {
                return Err(ChannelError::Transport("event channel closed".to_owned()));
            }
        }
        let listener = spawn_event_listener(self.client.base_url().to_owned(), event_tx);
        let socket = BridgeSocket {
            client: self.client.clone(),
            listener: Mutex::new(Some(listener)),
        };
        Ok(TransportSession {
            socket: Arc::new(socket),
            events,
        })
    }
}

/// A bridge session: the shared HTTP client plus this session's event listener.
struct BridgeSocket {
    client: WhatsAppClient,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Socket for BridgeSocket {
    async fn send_text(&self, to: &Jid, text: &str) -> Result<(), ChannelError> {
        self.client
            .send_text(&to.to_string(), text)
            .await
            .map_err(|e| e.into_channel_error(&to.to_string()))
    }

    async fn send_typing(&self, to: &Jid) {
        self.client.send_typing(&to.to_string()).await;
    }

    fn close(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("bridge event listener aborted");
        }
    }
}

impl Drop for BridgeSocket {
    fn drop(&mut self) {
        self.close();
    }
}
