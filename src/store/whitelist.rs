//! Whitelist rows.

use async_trait::async_trait;
use tracing::info;

use super::{SqliteStore, StoreError, WhitelistRepository};

#[async_trait]
impl WhitelistRepository for SqliteStore {
    async fn is_whitelisted(&self, channel: &str, identity: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM whitelist WHERE channel = ?1 AND identity = ?2")
                .bind(channel)
                .bind(identity)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.is_some())
    }

    async fn add_to_whitelist(&self, channel: &str, identity: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO whitelist (channel, identity) VALUES (?1, ?2)")
                .bind(channel)
                .bind(identity)
                .execute(self.pool())
                .await?;
        let added = result.rows_affected() > 0;
        if added {
            info!(channel, identity, "identity whitelisted");
        }
        Ok(added)
    }
}
