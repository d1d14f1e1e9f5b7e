//! The last-channel row.

use async_trait::async_trait;

use super::{ChannelRepository, SqliteStore, StoreError};

/// Who last talked to the assistant, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastChannel {
    /// Channel name.
    pub channel: String,
    /// User on that channel.
    pub user_id: String,
}

#[async_trait]
impl ChannelRepository for SqliteStore {
    async fn last_channel(&self) -> Result<Option<LastChannel>, StoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT channel, user_id FROM last_channel WHERE id = 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(channel, user_id)| LastChannel { channel, user_id }))
    }

    async fn save_last_channel(&self, channel: &str, user_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO last_channel (id, channel, user_id) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET channel = excluded.channel, \
             user_id = excluded.user_id, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(channel)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
