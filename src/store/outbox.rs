//! Outbox rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::trace;

use super::{format_timestamp, parse_timestamp, OutboxRepository, SqliteStore, StoreError};

/// Row type returned by SQLite queries for the outbox.
type OutboxRow = (i64, String, String, String, i64, i64, String);

/// A persisted outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Row id.
    pub id: i64,
    /// Channel the message goes out on.
    pub channel: String,
    /// Recipient on that channel.
    pub user_id: String,
    /// Message body.
    pub text: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Attempts allowed before the row is dropped.
    pub max_retries: u32,
    /// Earliest time of the next attempt.
    pub next_retry_at: DateTime<Utc>,
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

impl SqliteStore {
    /// Number of rows queued for `channel`, due or not.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn count_pending(&self, channel: &str) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE channel = ?1")
            .bind(channel)
            .fetch_one(self.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl OutboxRepository for SqliteStore {
    async fn enqueue(&self, channel: &str, user_id: &str, text: &str) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO outbox (channel, user_id, text, retry_count, max_retries, next_retry_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
        )
        .bind(channel)
        .bind(user_id)
        .bind(text)
        .bind(i64::from(self.max_retries))
        .bind(format_timestamp(Utc::now()))
        .execute(self.pool())
        .await?;
        let id = result.last_insert_rowid();
        trace!(id, channel, "outbox message enqueued");
        Ok(id)
    }

    async fn list_pending(&self, channel: &str) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT id, channel, user_id, text, retry_count, max_retries, next_retry_at \
             FROM outbox WHERE channel = ?1 AND next_retry_at <= ?2 \
             ORDER BY next_retry_at, id",
        )
        .bind(channel)
        .bind(format_timestamp(Utc::now()))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(
                |(id, channel, user_id, text, retry_count, max_retries, next_retry_at)| {
                    Ok(OutboxMessage {
                        id,
                        channel,
                        user_id,
                        text,
                        retry_count: to_u32(retry_count),
                        max_retries: to_u32(max_retries),
                        next_retry_at: parse_timestamp("next_retry_at", &next_retry_at)?,
                    })
                },
            )
            .collect()
    }

    async fn acknowledge(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET retry_count = ?1, next_retry_at = ?2 WHERE id = ?3")
            .bind(i64::from(retry_count))
            .bind(format_timestamp(next_retry_at))
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
