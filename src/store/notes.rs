//! Notes saved through `/remember`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{parse_timestamp, NoteRepository, SqliteStore, StoreError};

/// A saved note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    /// Row id.
    pub id: i64,
    /// Owner.
    pub user_id: String,
    /// Note text.
    pub content: String,
    /// When it was saved.
    pub created_at: DateTime<Utc>,
}

#[async_trait]
impl NoteRepository for SqliteStore {
    async fn save_note(&self, user_id: &str, content: &str) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO notes (user_id, content) VALUES (?1, ?2)")
            .bind(user_id)
            .bind(content)
            .execute(self.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn recent_notes(&self, user_id: &str, limit: usize) -> Result<Vec<Note>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, user_id, content, created_at FROM notes \
             WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(id, user_id, content, created_at)| {
                Ok(Note {
                    id,
                    user_id,
                    content,
                    created_at: parse_timestamp("created_at", &created_at)?,
                })
            })
            .collect()
    }
}
