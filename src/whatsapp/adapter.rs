//! WhatsApp channel adapter.
//!
//! Wires the Connection Manager, the Command Handler, and the outbox poller
//! together behind the generic [`Channel`] contract. Inbound messages are
//! handled one at a time in arrival order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use super::events::CHANNEL_NAME;
use super::jid::Jid;
use crate::assistant::Assistant;
use crate::channel::commands::{CommandAction, CommandHandler};
use crate::channel::{Channel, ChannelError, InboundMessage};
use crate::outbox::poller::OutboxPoller;
use crate::store::{ChannelRepository, WhitelistRepository};

/// Reply when the assistant backend fails.
pub const ASSISTANT_FAILURE_RESPONSE: &str =
    "Sorry, I couldn't come up with a reply just now. Please try again in a moment.";

/// Everything the adapter drives.
pub struct AdapterDeps {
    /// The connection.
    pub connection: ConnectionManager,
    /// Command parser and pairing guard.
    pub commands: CommandHandler,
    /// Whitelist storage.
    pub whitelist: Arc<dyn WhitelistRepository>,
    /// Last-channel storage.
    pub channels: Arc<dyn ChannelRepository>,
    /// Conversational backend.
    pub assistant: Arc<dyn Assistant>,
    /// Outbox poller for this channel.
    pub poller: OutboxPoller,
    /// Identities whitelisted on start without pairing.
    pub allowed_users: Vec<String>,
}

struct AdapterShared {
    deps: AdapterDeps,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The WhatsApp [`Channel`].
#[derive(Clone)]
pub struct WhatsAppChannel {
    shared: Arc<AdapterShared>,
}

impl std::fmt::Debug for WhatsAppChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhatsAppChannel")
            .field("connection", &self.shared.deps.connection)
            .finish_non_exhaustive()
    }
}

impl WhatsAppChannel {
    /// Create the adapter. `inbound_rx` is the receiving end of the channel
    /// the Connection Manager forwards messages into.
    pub fn new(deps: AdapterDeps, inbound_rx: mpsc::Receiver<InboundMessage>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(AdapterShared {
                deps,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.deps.connection
    }

    async fn seed_whitelist(&self) {
        let deps = &self.shared.deps;
        for raw in &deps.allowed_users {
            let identity = match Jid::parse(raw) {
                Ok(jid) => jid.user().to_owned(),
                Err(e) => {
                    warn!(user = %raw, error = %e, "skipping invalid allowed user");
                    continue;
                }
            };
            if let Err(e) = deps.whitelist.add_to_whitelist(CHANNEL_NAME, &identity).await {
                error!(identity, error = %e, "failed to seed whitelist");
            }
        }
    }

    /// Handle one inbound message: gate, classify, act, reply.
    pub async fn handle_inbound(&self, msg: InboundMessage) {
        let deps = &self.shared.deps;
        if msg.from_me || msg.is_group {
            debug!(from_me = msg.from_me, is_group = msg.is_group, "ignoring message");
            return;
        }

        let whitelisted = deps
            .whitelist
            .is_whitelisted(CHANNEL_NAME, &msg.sender)
            .await
            .unwrap_or_else(|e| {
                error!(sender = %msg.sender, error = %e, "whitelist lookup failed");
                false
            });

        let outcome = deps.commands.handle(&msg.sender, &msg.text, whitelisted);
        if outcome.handled {
            let action_reply = match outcome.action {
                Some(action) => Some(self.apply_action(&msg.sender, action).await),
                None => None,
            };
            if let Some(text) = outcome.response.or(action_reply) {
                self.reply(&msg.reply_to, &text).await;
            }
            return;
        }

        if let Err(e) = deps
            .channels
            .save_last_channel(CHANNEL_NAME, &msg.reply_to)
            .await
        {
            warn!(error = %e, "failed to record last channel");
        }

        deps.connection.send_typing(&msg.reply_to).await;
        let text = match deps.assistant.reply(&msg.sender, &msg.text).await {
            Ok(text) => text,
            Err(e) => {
                error!(sender = %msg.sender, error = %e, "assistant reply failed");
                ASSISTANT_FAILURE_RESPONSE.to_owned()
            }
        };
        self.reply(&msg.reply_to, &text).await;
    }

    async fn apply_action(&self, sender: &str, action: CommandAction) -> String {
        let deps = &self.shared.deps;
        match action {
            CommandAction::Pair(identity) => {
                match deps.whitelist.add_to_whitelist(CHANNEL_NAME, &identity).await {
                    Ok(true) => {
                        info!(identity, "sender paired");
                        "Paired.".to_owned()
                    }
                    Ok(false) => "Already paired.".to_owned(),
                    Err(e) => {
                        error!(identity, error = %e, "failed to persist pairing");
                        "Pairing failed. Please try again later.".to_owned()
                    }
                }
            }
            CommandAction::NewSession => {
                deps.assistant.reset_session(sender).await;
                "Started a new session.".to_owned()
            }
            CommandAction::Remember(note) => match deps.assistant.remember(sender, &note).await {
                Ok(()) => "Noted.".to_owned(),
                Err(e) => {
                    error!(error = %e, "failed to save note");
                    "Sorry, I couldn't save that note.".to_owned()
                }
            },
        }
    }

    async fn reply(&self, to: &str, text: &str) {
        if let Err(e) = self.shared.deps.connection.send_text(to, text).await {
            warn!(to, error = %e, "failed to send reply");
        }
    }

    async fn inbound_loop(self, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(msg) = rx.recv().await {
            self.handle_inbound(msg).await;
        }
        debug!("inbound message stream closed");
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self) -> anyhow::Result<()> {
        let rx = self
            .shared
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(rx) = rx else {
            anyhow::bail!("whatsapp channel already started");
        };

        self.seed_whitelist().await;

        let poller = self.shared.deps.poller.clone();
        self.shared
            .deps
            .connection
            .set_on_open(Arc::new(move || poller.flush()));

        let shutdown_rx = self.shared.shutdown_tx.subscribe();
        let poller_handle = self.shared.deps.poller.spawn(shutdown_rx);
        let inbound_handle = tokio::spawn(self.clone().inbound_loop(rx));
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([poller_handle, inbound_handle]);

        if let Err(e) = self.shared.deps.connection.connect().await {
            warn!(error = %e, "initial connect failed; reconnect scheduled");
        }
        info!("whatsapp channel started");
        Ok(())
    }

    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        self.shared.deps.connection.send_text(user_id, text).await
    }

    async fn stop(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.deps.connection.stop();
        let tasks: Vec<JoinHandle<()>> = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!("whatsapp channel stopped");
    }
}
