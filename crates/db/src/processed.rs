// crates/db/src/processed.rs
//! The `processed_conversations` watermark table.
//!
//! One row per composer id, recording how many messages have been captured.
//! Deliberately independent of the `conversations` table so the watermark
//! survives conversation deletes and keeps updates at-most-once.

use crate::{now_ms, Database, DbResult};
use hindsight_types::ProcessedConversation;
use std::collections::HashMap;

impl Database {
    /// Record that `composer_id` has been captured up to `message_count`.
    pub async fn mark_processed(&self, composer_id: &str, message_count: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_conversations (composer_id, message_count, last_processed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(composer_id) DO UPDATE SET
                message_count = excluded.message_count,
                last_processed_at = excluded.last_processed_at
            "#,
        )
        .bind(composer_id)
        .bind(message_count)
        .bind(now_ms())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Last processed message count; 0 when the row is missing.
    pub async fn get_processed_count(&self, composer_id: &str) -> DbResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT message_count FROM processed_conversations WHERE composer_id = ?",
        )
        .bind(composer_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    /// Full watermark row, if present.
    pub async fn get_processed(
        &self,
        composer_id: &str,
    ) -> DbResult<Option<ProcessedConversation>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT composer_id, message_count, last_processed_at
             FROM processed_conversations WHERE composer_id = ?",
        )
        .bind(composer_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(composer_id, message_count, last_processed_at)| {
            ProcessedConversation {
                composer_id,
                message_count,
                last_processed_at,
            }
        }))
    }

    /// All watermarks in one query — the startup scan diffs against this
    /// instead of issuing one lookup per composer.
    pub async fn get_all_processed_counts(&self) -> DbResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT composer_id, message_count FROM processed_conversations")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().collect())
    }
}
