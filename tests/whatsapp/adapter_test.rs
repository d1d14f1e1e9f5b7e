//! Tests for `whatsapp::adapter` inbound handling and start-up wiring.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hearth::channel::commands::CommandHandler;
use hearth::channel::pairing::{PairingGuard, PairingPolicy};
use hearth::channel::{Channel, MessageSender};
use hearth::outbox::poller::OutboxPoller;
use hearth::outbox::OutboxProcessor;
use hearth::store::{ChannelRepository, OutboxRepository, WhitelistRepository};
use hearth::whatsapp::adapter::{AdapterDeps, WhatsAppChannel, ASSISTANT_FAILURE_RESPONSE};
use hearth::whatsapp::events::TransportEvent;

use crate::support::{inbound, manager, settle, FakeAssistant, FakeTransport, MemoryStore};

const STRANGER: &str = "15550000001";
const OWNER: &str = "15551234567";

struct Harness {
    channel: WhatsAppChannel,
    transport: Arc<FakeTransport>,
    store: Arc<MemoryStore>,
    assistant: Arc<FakeAssistant>,
}

impl Harness {
    fn sent(&self) -> Vec<(String, String)> {
        self.transport.socket(0).sent()
    }

    fn last_reply(&self) -> String {
        self.sent().last().map(|(_, text)| text.clone()).unwrap_or_default()
    }
}

fn build(token: Option<&str>, allowed_users: Vec<String>) -> Harness {
    let transport = FakeTransport::new();
    let (connection, inbound_rx) = manager(&transport);
    let store = MemoryStore::new();
    let assistant = FakeAssistant::new();

    let sender: Arc<dyn MessageSender> = Arc::new(connection.clone());
    let processor = Arc::new(OutboxProcessor::new(
        store.clone(),
        sender,
        Duration::from_secs(60),
    ));
    let poller = OutboxPoller::new("whatsapp", store.clone(), processor, Duration::from_secs(30));

    let pairing = PairingGuard::new(token.map(str::to_owned), PairingPolicy::default());
    let channel = WhatsAppChannel::new(
        AdapterDeps {
            connection,
            commands: CommandHandler::new(pairing),
            whitelist: store.clone(),
            channels: store.clone(),
            assistant: assistant.clone(),
            poller,
            allowed_users,
        },
        inbound_rx,
    );
    Harness {
        channel,
        transport,
        store,
        assistant,
    }
}

async fn open(h: &Harness) {
    h.channel.connection().connect().await.expect("connect");
    h.transport.emit(0, TransportEvent::Open).await;
    assert!(h.channel.connection().is_connected());
}

#[tokio::test(start_paused = true)]
async fn stranger_is_told_their_id() {
    let h = build(Some("s3cret"), Vec::new());
    open(&h).await;

    h.channel.handle_inbound(inbound(STRANGER, "hello")).await;

    let reply = h.last_reply();
    assert!(reply.contains("Access restricted."));
    assert!(reply.contains(STRANGER));
    assert!(reply.contains("/pair"));
    assert!(h.assistant.replies().is_empty());
    assert_eq!(h.sent()[0].0, format!("{STRANGER}@s.whatsapp.net"));
}

#[tokio::test(start_paused = true)]
async fn pairing_whitelists_then_passes_through() {
    let h = build(Some("s3cret"), Vec::new());
    open(&h).await;

    h.channel.handle_inbound(inbound(STRANGER, "/pair wrong")).await;
    assert_eq!(h.last_reply(), "Invalid pairing token.");

    h.channel.handle_inbound(inbound(STRANGER, "/pair s3cret")).await;
    assert_eq!(h.last_reply(), "Paired.");
    assert!(h
        .store
        .is_whitelisted("whatsapp", STRANGER)
        .await
        .expect("lookup"));

    h.channel.handle_inbound(inbound(STRANGER, "/pair s3cret")).await;
    assert_eq!(h.last_reply(), "Already paired.");

    h.channel.handle_inbound(inbound(STRANGER, "what's the weather")).await;
    assert_eq!(h.last_reply(), "echo: what's the weather");

    let last = h.store.last_channel().await.expect("load").expect("saved");
    assert_eq!(last.channel, "whatsapp");
    assert_eq!(last.user_id, format!("{STRANGER}@s.whatsapp.net"));
}

#[tokio::test(start_paused = true)]
async fn own_and_group_messages_are_ignored() {
    let h = build(Some("s3cret"), Vec::new());
    open(&h).await;

    let mut own = inbound(OWNER, "note to self");
    own.from_me = true;
    let mut group = inbound(STRANGER, "/pair s3cret");
    group.is_group = true;

    h.channel.handle_inbound(own).await;
    h.channel.handle_inbound(group).await;

    assert!(h.sent().is_empty());
    assert!(!h
        .store
        .is_whitelisted("whatsapp", STRANGER)
        .await
        .expect("lookup"));
}

#[tokio::test(start_paused = true)]
async fn commands_reach_the_assistant() {
    let h = build(None, Vec::new());
    h.store
        .add_to_whitelist("whatsapp", OWNER)
        .await
        .expect("seed");
    open(&h).await;

    h.channel.handle_inbound(inbound(OWNER, "/new")).await;
    assert_eq!(h.last_reply(), "Started a new session.");
    assert_eq!(
        h.assistant.resets.lock().expect("lock").clone(),
        vec![OWNER.to_owned()]
    );

    h.channel
        .handle_inbound(inbound(OWNER, "/remember dentist on friday"))
        .await;
    assert_eq!(h.last_reply(), "Noted.");
    assert_eq!(
        h.assistant.notes.lock().expect("lock").clone(),
        vec![(OWNER.to_owned(), "dentist on friday".to_owned())]
    );
}

#[tokio::test(start_paused = true)]
async fn assistant_failure_sends_apology() {
    let h = build(None, Vec::new());
    h.store
        .add_to_whitelist("whatsapp", OWNER)
        .await
        .expect("seed");
    open(&h).await;
    h.assistant.fail.store(true, Ordering::SeqCst);

    h.channel.handle_inbound(inbound(OWNER, "hi")).await;
    assert_eq!(h.last_reply(), ASSISTANT_FAILURE_RESPONSE);
}

#[tokio::test(start_paused = true)]
async fn start_seeds_whitelist_and_flushes_outbox_on_open() {
    let h = build(None, vec!["+15551234567".to_owned()]);
    h.store
        .enqueue("whatsapp", "15557654321@s.whatsapp.net", "reminder")
        .await
        .expect("enqueue");

    h.channel.start().await.expect("start");
    settle().await;
    assert!(h
        .store
        .is_whitelisted("whatsapp", OWNER)
        .await
        .expect("lookup"));
    assert!(h.store.rows().len() == 1, "nothing sent before open");

    h.transport.emit(0, TransportEvent::Open).await;
    settle().await;

    assert_eq!(
        h.sent(),
        vec![("15557654321@s.whatsapp.net".to_owned(), "reminder".to_owned())]
    );
    assert!(h.store.rows().is_empty());

    // Inbound messages flow through the started loop as well.
    h.transport
        .emit(0, TransportEvent::Message(inbound(OWNER, "ping")))
        .await;
    settle().await;
    assert_eq!(h.last_reply(), "echo: ping");

    assert!(h.channel.start().await.is_err(), "second start is rejected");
    h.channel.stop().await;
    assert!(!h.channel.connection().is_connected());
}
