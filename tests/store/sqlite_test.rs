//! Tests for the SQLite repositories.

use chrono::{Duration, Utc};

use hearth::store::{
    ChannelRepository, NoteRepository, OutboxRepository, SqliteStore, WhitelistRepository,
    DEFAULT_MAX_RETRIES,
};

async fn store() -> SqliteStore {
    SqliteStore::open_in_memory().await.expect("open store")
}

#[tokio::test]
async fn enqueued_rows_are_due_immediately() {
    let store = store().await;
    let id = store
        .enqueue("whatsapp", "15551234567@s.whatsapp.net", "hello")
        .await
        .expect("enqueue");

    let pending = store.list_pending("whatsapp").await.expect("list");
    assert_eq!(pending.len(), 1);
    let row = &pending[0];
    assert_eq!(row.id, id);
    assert_eq!(row.text, "hello");
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.max_retries, DEFAULT_MAX_RETRIES);
    assert!(store.list_pending("telegram").await.expect("list").is_empty());
}

#[tokio::test]
async fn rescheduled_rows_wait_until_due() {
    let store = store().await.with_max_retries(7);
    let later = store.enqueue("whatsapp", "a", "later").await.expect("enqueue");
    let now = store.enqueue("whatsapp", "b", "now").await.expect("enqueue");

    store
        .mark_retry(later, 1, Utc::now() + Duration::minutes(5))
        .await
        .expect("mark");

    let pending = store.list_pending("whatsapp").await.expect("list");
    assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![now]);
    assert_eq!(pending[0].max_retries, 7);
    assert_eq!(store.count_pending("whatsapp").await.expect("count"), 2);

    store
        .mark_retry(later, 2, Utc::now() - Duration::seconds(1))
        .await
        .expect("mark");
    let pending = store.list_pending("whatsapp").await.expect("list");
    let row = pending.iter().find(|r| r.id == later).expect("due again");
    assert_eq!(row.retry_count, 2);
}

#[tokio::test]
async fn acknowledge_removes_the_row() {
    let store = store().await;
    let id = store.enqueue("whatsapp", "a", "bye").await.expect("enqueue");
    store.acknowledge(id).await.expect("ack");
    store.acknowledge(id).await.expect("second ack is a no-op");
    assert_eq!(store.count_pending("whatsapp").await.expect("count"), 0);
}

#[tokio::test]
async fn whitelist_is_per_channel_and_idempotent() {
    let store = store().await;
    assert!(!store.is_whitelisted("whatsapp", "15551234567").await.expect("check"));

    assert!(store.add_to_whitelist("whatsapp", "15551234567").await.expect("add"));
    assert!(!store.add_to_whitelist("whatsapp", "15551234567").await.expect("re-add"));

    assert!(store.is_whitelisted("whatsapp", "15551234567").await.expect("check"));
    assert!(!store.is_whitelisted("telegram", "15551234567").await.expect("check"));
}

#[tokio::test]
async fn last_channel_is_a_single_row() {
    let store = store().await;
    assert!(store.last_channel().await.expect("load").is_none());

    store.save_last_channel("whatsapp", "a@s.whatsapp.net").await.expect("save");
    store.save_last_channel("whatsapp", "b@s.whatsapp.net").await.expect("save");

    let last = store.last_channel().await.expect("load").expect("row");
    assert_eq!(last.channel, "whatsapp");
    assert_eq!(last.user_id, "b@s.whatsapp.net");
}

#[tokio::test]
async fn notes_come_back_newest_first() {
    let store = store().await;
    for note in ["first", "second", "third"] {
        store.save_note("alice", note).await.expect("save");
    }
    store.save_note("bob", "not alice's").await.expect("save");

    let notes = store.recent_notes("alice", 2).await.expect("load");
    let contents: Vec<&str> = notes.iter().map(|n| n.content.as_str()).collect();
    assert_eq!(contents, vec!["third", "second"]);
    assert!(notes.iter().all(|n| n.user_id == "alice"));
}

#[tokio::test]
async fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("hearth.db");

    let store = SqliteStore::open(&path).await.expect("open");
    store.enqueue("whatsapp", "a", "persisted").await.expect("enqueue");
    store.add_to_whitelist("whatsapp", "15551234567").await.expect("add");
    store.close().await;

    let reopened = SqliteStore::open(&path).await.expect("reopen");
    let pending = reopened.list_pending("whatsapp").await.expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].text, "persisted");
    assert!(reopened
        .is_whitelisted("whatsapp", "15551234567")
        .await
        .expect("check"));
    reopened.close().await;
}
