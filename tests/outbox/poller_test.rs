//! Tests for the outbox poll loop and in-flight dedupe.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use hearth::channel::MessageSender;
use hearth::outbox::poller::OutboxPoller;
use hearth::outbox::OutboxProcessor;
use hearth::store::OutboxRepository;

use crate::support::{settle, MemoryStore, RecordingSender};

fn poller(store: &Arc<MemoryStore>, sender: &Arc<RecordingSender>) -> OutboxPoller {
    poller_every(store, sender, Duration::from_secs(30))
}

fn poller_every(
    store: &Arc<MemoryStore>,
    sender: &Arc<RecordingSender>,
    interval: Duration,
) -> OutboxPoller {
    let dyn_sender: Arc<dyn MessageSender> = sender.clone();
    let processor = Arc::new(OutboxProcessor::new(
        store.clone(),
        dyn_sender,
        Duration::from_secs(60),
    ));
    OutboxPoller::new("whatsapp", store.clone(), processor, interval)
}

async fn enqueue(store: &MemoryStore, channel: &str, text: &str) -> i64 {
    store
        .enqueue(channel, "15551234567@s.whatsapp.net", text)
        .await
        .expect("enqueue")
}

#[tokio::test]
async fn poll_is_skipped_while_sender_is_not_ready() {
    let store = MemoryStore::new();
    let sender = RecordingSender::new();
    sender.not_ready.store(true, Ordering::SeqCst);
    enqueue(&store, "whatsapp", "hello").await;

    let poller = poller(&store, &sender);
    assert_eq!(poller.poll_once().await, 0);
    assert!(poller.in_flight().is_empty());
}

#[tokio::test]
async fn rows_in_flight_are_not_queued_twice() {
    let store = MemoryStore::new();
    let sender = RecordingSender::new();
    let a = enqueue(&store, "whatsapp", "one").await;
    let b = enqueue(&store, "whatsapp", "two").await;
    enqueue(&store, "telegram", "elsewhere").await;

    let poller = poller(&store, &sender);
    assert_eq!(poller.poll_once().await, 2);
    assert_eq!(poller.in_flight(), vec![a, b]);

    // No worker is running, so both rows are still in flight.
    assert_eq!(poller.poll_once().await, 0);
    assert!(sender.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn running_loop_delivers_each_row_once() {
    let store = MemoryStore::new();
    let sender = RecordingSender::new();
    enqueue(&store, "whatsapp", "one").await;
    enqueue(&store, "whatsapp", "two").await;

    let poller = poller(&store, &sender);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = poller.spawn(shutdown_rx);
    settle().await;

    let texts: Vec<String> = sender.sent().into_iter().map(|(_, text)| text).collect();
    assert_eq!(texts, vec!["one".to_owned(), "two".to_owned()]);
    assert!(store.rows().is_empty());
    assert!(poller.in_flight().is_empty());

    shutdown_tx.send(true).expect("loop alive");
    handle.await.expect("loop exits");
}

#[tokio::test(start_paused = true)]
async fn flush_polls_without_waiting_for_the_interval() {
    let store = MemoryStore::new();
    let sender = RecordingSender::new();
    sender.not_ready.store(true, Ordering::SeqCst);

    let poller = poller(&store, &sender);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = poller.spawn(shutdown_rx);
    settle().await;

    enqueue(&store, "whatsapp", "queued while offline").await;
    sender.not_ready.store(false, Ordering::SeqCst);
    assert!(sender.sent().is_empty());

    poller.flush();
    settle().await;
    assert_eq!(sender.sent().len(), 1);
    assert!(store.rows().is_empty());

    shutdown_tx.send(true).expect("loop alive");
    handle.await.expect("loop exits");
}

#[tokio::test(start_paused = true)]
async fn zero_interval_is_clamped_instead_of_panicking() {
    let store = MemoryStore::new();
    let sender = RecordingSender::new();
    enqueue(&store, "whatsapp", "still delivered").await;

    let poller = poller_every(&store, &sender, Duration::ZERO);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = poller.spawn(shutdown_rx);
    settle().await;

    assert_eq!(sender.sent().len(), 1);
    shutdown_tx.send(true).expect("loop alive");
    handle.await.expect("poll loop must not panic");
}
