// crates/capture/src/updater.rs
//! Incremental capture with at-most-once semantics.
//!
//! The `processed_conversations` watermark records how many messages of
//! each conversation have been persisted. Growth is detected by comparing
//! the editor's header count against the watermark; processing appends
//! only the unseen suffix, and the suffix plus the new watermark commit in
//! one transaction.

use crate::session::SessionManager;
use crate::CaptureError;
use hindsight_core::Parser;
use hindsight_db::Database;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Updater {
    parser: Arc<Parser>,
    db: Database,
    sessions: Arc<SessionManager>,
}

impl Updater {
    pub fn new(parser: Arc<Parser>, db: Database, sessions: Arc<SessionManager>) -> Self {
        Self {
            parser,
            db,
            sessions,
        }
    }

    /// Composer ids whose current header count exceeds their watermark.
    ///
    /// Conversations that cannot be counted (corrupt or vanished composer
    /// data) are skipped with a warning rather than failing the sweep.
    pub async fn detect_updated(&self) -> Result<Vec<String>, CaptureError> {
        let ids = self.parser.composer_ids().await?;
        let processed = self.db.get_all_processed_counts().await?;

        let mut updated = Vec::new();
        for id in ids {
            let current = match self.parser.header_count(&id).await {
                Ok(count) => count as i64,
                Err(e) => {
                    warn!(composer_id = %id, error = %e, "cannot read header count, skipping");
                    continue;
                }
            };
            let last = processed.get(&id).copied().unwrap_or(0);
            if current > last {
                updated.push(id);
            }
        }
        debug!(count = updated.len(), "conversations with new messages");
        Ok(updated)
    }

    /// Capture the unseen message suffix of one conversation.
    ///
    /// Success without effect when: the conversation has no messages, its
    /// row has not been created yet (the new-conversation path owns that
    /// case), or the watermark already covers everything parsed.
    pub async fn process_update(&self, composer_id: &str) -> Result<(), CaptureError> {
        let processed = self.db.get_processed_count(composer_id).await?;
        let conv = self.parser.parse_conversation(composer_id).await?;

        if conv.is_empty() {
            return Ok(());
        }
        if !self.db.conversation_exists(composer_id).await? {
            debug!(composer_id, "conversation not persisted yet, leaving to the new-conversation path");
            return Ok(());
        }

        let total = conv.message_count() as i64;
        if processed >= total {
            return Ok(());
        }

        let new_batch = &conv.messages[processed as usize..];
        self.db
            .apply_conversation_update(composer_id, new_batch, total)
            .await?;
        debug!(
            composer_id,
            appended = new_batch.len(),
            watermark = total,
            "conversation updated"
        );

        if let Some(last_ts) = new_batch.iter().map(|m| m.created_at).max() {
            if let Some(session_id) = self.db.conversation_session_id(composer_id).await? {
                self.sessions.touch_session(&session_id, last_ts).await?;
            }
        }

        Ok(())
    }

    /// Directly set a conversation's watermark.
    pub async fn mark_processed(
        &self,
        composer_id: &str,
        message_count: i64,
    ) -> Result<(), CaptureError> {
        self.db.mark_processed(composer_id, message_count).await?;
        Ok(())
    }

    /// Read a conversation's watermark (0 when absent).
    pub async fn get_processed_count(&self, composer_id: &str) -> Result<i64, CaptureError> {
        Ok(self.db.get_processed_count(composer_id).await?)
    }
}
