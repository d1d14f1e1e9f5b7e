//! SQLite persistence for the outbox, whitelist, last channel, and notes.
//!
//! Each concern is a small async trait so the outbox processor, heartbeat,
//! and adapter can be tested against in-memory fakes. [`SqliteStore`]
//! implements all of them over one pool. The schema is applied inline via
//! `include_str!` on every open; every statement is idempotent.

pub mod channel;
pub mod notes;
pub mod outbox;
pub mod whitelist;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

pub use self::channel::LastChannel;
pub use self::notes::Note;
pub use self::outbox::OutboxMessage;

/// Schema applied on open.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// Default per-row retry budget for rows enqueued through [`SqliteStore`].
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The schema could not be applied.
    #[error("schema migration failed: {0}")]
    Migration(String),

    /// A stored timestamp did not parse.
    #[error("invalid timestamp {value:?} in {column}")]
    InvalidTimestamp {
        /// Column holding the bad value.
        column: &'static str,
        /// The stored text.
        value: String,
    },

    /// Filesystem failure while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable queue of outbound messages awaiting delivery.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Queue a message for immediate delivery. Returns the row id.
    async fn enqueue(&self, channel: &str, user_id: &str, text: &str) -> Result<i64, StoreError>;

    /// Rows for `channel` whose `next_retry_at` has passed, oldest due first.
    async fn list_pending(&self, channel: &str) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Remove a row (delivered, poisoned, or exhausted).
    async fn acknowledge(&self, id: i64) -> Result<(), StoreError>;

    /// Record a failed attempt and when to try again.
    async fn mark_retry(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Per-channel set of identities allowed to talk to the assistant.
#[async_trait]
pub trait WhitelistRepository: Send + Sync {
    /// Whether `identity` may use `channel`.
    async fn is_whitelisted(&self, channel: &str, identity: &str) -> Result<bool, StoreError>;

    /// Add `identity`. Returns `false` when it was already present.
    async fn add_to_whitelist(&self, channel: &str, identity: &str) -> Result<bool, StoreError>;
}

/// Remembers who last talked to the assistant.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// The last channel and user, if anyone has talked yet.
    async fn last_channel(&self) -> Result<Option<LastChannel>, StoreError>;

    /// Record `user_id` on `channel` as the last speaker.
    async fn save_last_channel(&self, channel: &str, user_id: &str) -> Result<(), StoreError>;
}

/// Free-form notes saved through `/remember`.
#[async_trait]
pub trait NoteRepository: Send + Sync {
    /// Save a note. Returns the row id.
    async fn save_note(&self, user_id: &str, content: &str) -> Result<i64, StoreError>;

    /// Most recent notes for `user_id`, newest first.
    async fn recent_notes(&self, user_id: &str, limit: usize) -> Result<Vec<Note>, StoreError>;
}

/// All repositories over a single SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_retries: u32,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        debug!(path = %path.display(), "store opened");
        Self::with_pool(pool).await
    }

    /// Open a private in-memory database. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot be initialised.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        // Every connection to `:memory:` is its own database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if the schema fails to apply.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self {
            pool,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Set the retry budget stamped on newly enqueued outbox rows.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Render a timestamp the way the schema stores it.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            column,
            value: value.to_owned(),
        })
}
