// crates/db/src/conversations.rs
//! Normalized persistence of conversations and their messages.
//!
//! Every operation runs in one transaction and fails whole: either the
//! conversation row, its messages, and the derived counters all land, or
//! none do. Messages read back in `(created_at, rowid)` order — rowid is
//! assigned at first insert and survives upserts, which is exactly the
//! insertion-order tie-break the session timeline needs.

use crate::{Database, DbError, DbResult};
use hindsight_types::{
    CodeBlock, ContentSource, Conversation, ConversationStatus, Message, Role, ToolCall,
};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::warn;

const UPSERT_MESSAGE_SQL: &str = r#"
    INSERT INTO messages (bubble_id, conversation_id, msg_type, role, text,
                          thinking_text, code_blocks, tool_calls, has_code,
                          has_thinking, has_tool_calls, content_source,
                          created_at, metadata)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(bubble_id) DO UPDATE SET
        conversation_id = excluded.conversation_id,
        msg_type = excluded.msg_type,
        role = excluded.role,
        text = excluded.text,
        thinking_text = excluded.thinking_text,
        code_blocks = excluded.code_blocks,
        tool_calls = excluded.tool_calls,
        has_code = excluded.has_code,
        has_thinking = excluded.has_thinking,
        has_tool_calls = excluded.has_tool_calls,
        content_source = excluded.content_source,
        created_at = excluded.created_at,
        metadata = excluded.metadata
"#;

/// Serialize a list column; empty lists persist as NULL.
fn json_or_null<T: serde::Serialize>(items: &[T]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        serde_json::to_string(items).ok()
    }
}

fn metadata_or_null(map: &Map<String, Value>) -> Option<String> {
    if map.is_empty() {
        None
    } else {
        serde_json::to_string(map).ok()
    }
}

async fn upsert_message(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    msg: &Message,
) -> DbResult<()> {
    sqlx::query(UPSERT_MESSAGE_SQL)
        .bind(&msg.bubble_id)
        .bind(conversation_id)
        .bind(msg.msg_type)
        .bind(msg.role.as_str())
        .bind(&msg.text)
        .bind(&msg.thinking_text)
        .bind(json_or_null(&msg.code_blocks))
        .bind(json_or_null(&msg.tool_calls))
        .bind(msg.has_code())
        .bind(msg.has_thinking())
        .bind(msg.has_tool_calls())
        .bind(msg.content_source.as_str())
        .bind(msg.created_at)
        .bind(metadata_or_null(&msg.metadata))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn session_exists(tx: &mut Transaction<'_, Sqlite>, session_id: &str) -> DbResult<bool> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE id = ?")
        .bind(session_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count.0 > 0)
}

async fn conversation_exists_tx(
    tx: &mut Transaction<'_, Sqlite>,
    composer_id: &str,
) -> DbResult<bool> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE composer_id = ?")
        .bind(composer_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count.0 > 0)
}

/// Decode one message row. Any malformed JSON column fails the row.
fn message_from_row(row: &SqliteRow) -> Result<Message, String> {
    let bubble_id: String = row.try_get("bubble_id").map_err(|e| e.to_string())?;
    let msg_type: i64 = row.try_get("msg_type").map_err(|e| e.to_string())?;
    let role: String = row.try_get("role").map_err(|e| e.to_string())?;
    let text: String = row.try_get("text").map_err(|e| e.to_string())?;
    let thinking_text: Option<String> =
        row.try_get("thinking_text").map_err(|e| e.to_string())?;
    let code_blocks_raw: Option<String> =
        row.try_get("code_blocks").map_err(|e| e.to_string())?;
    let tool_calls_raw: Option<String> = row.try_get("tool_calls").map_err(|e| e.to_string())?;
    let content_source: String = row.try_get("content_source").map_err(|e| e.to_string())?;
    let created_at: i64 = row.try_get("created_at").map_err(|e| e.to_string())?;
    let metadata_raw: Option<String> = row.try_get("metadata").map_err(|e| e.to_string())?;

    let code_blocks: Vec<CodeBlock> = match code_blocks_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    let tool_calls: Vec<ToolCall> = match tool_calls_raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    // Unreadable metadata degrades to an empty map rather than losing the row
    let metadata: Map<String, Value> = metadata_raw
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(Message {
        bubble_id,
        msg_type,
        role: if role == "user" {
            Role::User
        } else {
            Role::Assistant
        },
        text,
        thinking_text,
        code_blocks,
        tool_calls,
        content_source: ContentSource::parse(&content_source),
        created_at,
        metadata,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Conversation {
        composer_id: row.try_get("composer_id")?,
        name: row.try_get("name")?,
        status: ConversationStatus::parse(&status),
        created_at: row.try_get("created_at")?,
        messages: Vec::new(),
    })
}

impl Database {
    /// Upsert a conversation and all of its messages under `session_id`.
    ///
    /// Fails with [`DbError::SessionNotFound`] when the session row is
    /// absent. Derived counters are recomputed from the payload.
    pub async fn store_conversation(
        &self,
        conv: &Conversation,
        session_id: &str,
    ) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        if !session_exists(&mut tx, session_id).await? {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO conversations (composer_id, session_id, name, status,
                                       created_at, message_count,
                                       first_message_time, last_message_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(composer_id) DO UPDATE SET
                session_id = excluded.session_id,
                name = excluded.name,
                status = excluded.status,
                created_at = excluded.created_at,
                message_count = excluded.message_count,
                first_message_time = excluded.first_message_time,
                last_message_time = excluded.last_message_time
            "#,
        )
        .bind(&conv.composer_id)
        .bind(session_id)
        .bind(&conv.name)
        .bind(conv.status.as_str())
        .bind(conv.created_at)
        .bind(conv.message_count() as i64)
        .bind(conv.first_message_time())
        .bind(conv.last_message_time())
        .execute(&mut *tx)
        .await?;

        for msg in &conv.messages {
            upsert_message(&mut tx, &conv.composer_id, msg).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Upsert a single message and advance the parent conversation's
    /// derived counters.
    pub async fn store_message(&self, msg: &Message, conversation_id: &str) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        if !conversation_exists_tx(&mut tx, conversation_id).await? {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        upsert_message(&mut tx, conversation_id, msg).await?;
        bump_conversation_counters(&mut tx, conversation_id, 1, msg.created_at, msg.created_at)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Append a batch of new messages to an existing conversation.
    pub async fn update_conversation(
        &self,
        conversation_id: &str,
        new_messages: &[Message],
    ) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        if !conversation_exists_tx(&mut tx, conversation_id).await? {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        if new_messages.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        for msg in new_messages {
            upsert_message(&mut tx, conversation_id, msg).await?;
        }

        let batch_min = new_messages.iter().map(|m| m.created_at).min().unwrap_or(0);
        let batch_max = new_messages.iter().map(|m| m.created_at).max().unwrap_or(0);
        bump_conversation_counters(
            &mut tx,
            conversation_id,
            new_messages.len() as i64,
            batch_min,
            batch_max,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Append a batch of new messages and advance the processed watermark
    /// in the same transaction — either both land or neither is visible.
    pub async fn apply_conversation_update(
        &self,
        conversation_id: &str,
        new_messages: &[Message],
        processed_count: i64,
    ) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        if !conversation_exists_tx(&mut tx, conversation_id).await? {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        if !new_messages.is_empty() {
            for msg in new_messages {
                upsert_message(&mut tx, conversation_id, msg).await?;
            }
            let batch_min = new_messages.iter().map(|m| m.created_at).min().unwrap_or(0);
            let batch_max = new_messages.iter().map(|m| m.created_at).max().unwrap_or(0);
            // Recount from the rows: concurrent handlers replaying the same
            // suffix dedupe on bubble_id, so a relative bump would drift.
            sqlx::query(
                r#"
                UPDATE conversations SET
                    message_count = (SELECT COUNT(*) FROM messages
                                     WHERE conversation_id = ?),
                    first_message_time = CASE
                        WHEN first_message_time IS NULL OR ? < first_message_time
                        THEN ? ELSE first_message_time END,
                    last_message_time = CASE
                        WHEN last_message_time IS NULL OR ? > last_message_time
                        THEN ? ELSE last_message_time END
                WHERE composer_id = ?
                "#,
            )
            .bind(conversation_id)
            .bind(batch_min)
            .bind(batch_min)
            .bind(batch_max)
            .bind(batch_max)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO processed_conversations (composer_id, message_count, last_processed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(composer_id) DO UPDATE SET
                message_count = excluded.message_count,
                last_processed_at = excluded.last_processed_at
            "#,
        )
        .bind(conversation_id)
        .bind(processed_count)
        .bind(crate::now_ms())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Whether a conversation row has been persisted.
    pub async fn conversation_exists(&self, composer_id: &str) -> DbResult<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE composer_id = ?")
                .bind(composer_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count.0 > 0)
    }

    /// The session owning a conversation, if the conversation exists.
    pub async fn conversation_session_id(&self, composer_id: &str) -> DbResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_id FROM conversations WHERE composer_id = ?")
                .bind(composer_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Count of messages actually stored for a conversation.
    pub async fn stored_message_count(&self, composer_id: &str) -> DbResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(composer_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count.0)
    }

    /// Fetch one conversation with its messages in timeline order.
    pub async fn get_conversation(&self, composer_id: &str) -> DbResult<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE composer_id = ?")
            .bind(composer_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut conv = conversation_from_row(&row)?;
        conv.messages = self.get_conversation_messages(composer_id).await?;
        Ok(Some(conv))
    }

    /// Messages for a conversation in `(created_at, insertion)` order.
    ///
    /// A row that fails to decode is skipped with a warning; the rest of
    /// the conversation still loads.
    pub async fn get_conversation_messages(&self, composer_id: &str) -> DbResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(composer_id)
        .fetch_all(self.pool())
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            match message_from_row(row) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(conversation_id = %composer_id, error = %e, "skipping undecodable message row");
                }
            }
        }
        Ok(messages)
    }

    /// Conversations belonging to a session, ordered by creation time,
    /// messages included.
    pub async fn get_session_conversations(
        &self,
        session_id: &str,
    ) -> DbResult<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE session_id = ? ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut conv = conversation_from_row(row)?;
            conv.messages = self.get_conversation_messages(&conv.composer_id).await?;
            conversations.push(conv);
        }
        Ok(conversations)
    }
}

/// Advance `message_count` and widen the min/max message times.
async fn bump_conversation_counters(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    added: i64,
    batch_min: i64,
    batch_max: i64,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE conversations SET
            message_count = message_count + ?,
            first_message_time = CASE
                WHEN first_message_time IS NULL OR ? < first_message_time
                THEN ? ELSE first_message_time END,
            last_message_time = CASE
                WHEN last_message_time IS NULL OR ? > last_message_time
                THEN ? ELSE last_message_time END
        WHERE composer_id = ?
        "#,
    )
    .bind(added)
    .bind(batch_min)
    .bind(batch_min)
    .bind(batch_max)
    .bind(batch_max)
    .bind(conversation_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::test_support::session;
    use pretty_assertions::assert_eq;

    fn message(bubble_id: &str, created_at: i64, text: &str) -> Message {
        Message {
            bubble_id: bubble_id.to_string(),
            msg_type: 1,
            role: Role::User,
            text: text.to_string(),
            thinking_text: None,
            code_blocks: vec![],
            tool_calls: vec![],
            content_source: ContentSource::Text,
            created_at,
            metadata: Map::new(),
        }
    }

    fn conversation(composer_id: &str, messages: Vec<Message>) -> Conversation {
        Conversation {
            composer_id: composer_id.to_string(),
            name: "chat".to_string(),
            status: ConversationStatus::Active,
            created_at: 1000,
            messages,
        }
    }

    async fn db_with_session(id: &str) -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_session(&session(id, "proj-a", 1000)).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_store_conversation_requires_session() {
        let db = Database::new_in_memory().await.unwrap();
        let conv = conversation("c1", vec![message("b1", 1000, "hi")]);
        assert!(matches!(
            db.store_conversation(&conv, "ghost").await,
            Err(DbError::SessionNotFound(_))
        ));
        assert!(!db.conversation_exists("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_and_read_back_ordering() {
        let db = db_with_session("s1").await;
        let conv = conversation(
            "c1",
            vec![
                message("b2", 2000, "second"),
                message("b1", 1000, "first"),
                message("b3", 3000, "third"),
            ],
        );
        db.store_conversation(&conv, "s1").await.unwrap();

        let loaded = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "chat");
        let order: Vec<&str> = loaded.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);

        // Derived counters reflect the payload
        let (count, first, last): (i64, i64, i64) = sqlx::query_as(
            "SELECT message_count, first_message_time, last_message_time FROM conversations WHERE composer_id = 'c1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!((count, first, last), (3, 1000, 3000));
    }

    #[tokio::test]
    async fn test_store_conversation_is_idempotent() {
        let db = db_with_session("s1").await;
        let conv = conversation(
            "c1",
            vec![message("b1", 1000, "one"), message("b2", 2000, "two")],
        );
        db.store_conversation(&conv, "s1").await.unwrap();
        db.store_conversation(&conv, "s1").await.unwrap();

        assert_eq!(db.stored_message_count("c1").await.unwrap(), 2);
        let loaded = db.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_insertion_order() {
        let db = db_with_session("s1").await;
        let conv = conversation(
            "c1",
            vec![
                message("b-z", 1000, "first-inserted"),
                message("b-a", 1000, "second-inserted"),
            ],
        );
        db.store_conversation(&conv, "s1").await.unwrap();

        let loaded = db.get_conversation_messages("c1").await.unwrap();
        let order: Vec<&str> = loaded.iter().map(|m| m.text.as_str()).collect();
        // Insertion order, not bubble-id order, breaks the tie
        assert_eq!(order, vec!["first-inserted", "second-inserted"]);
    }

    #[tokio::test]
    async fn test_store_message_updates_counters() {
        let db = db_with_session("s1").await;
        db.store_conversation(&conversation("c1", vec![message("b1", 2000, "mid")]), "s1")
            .await
            .unwrap();

        db.store_message(&message("b0", 1000, "early"), "c1")
            .await
            .unwrap();
        db.store_message(&message("b2", 3000, "late"), "c1")
            .await
            .unwrap();

        let (count, first, last): (i64, i64, i64) = sqlx::query_as(
            "SELECT message_count, first_message_time, last_message_time FROM conversations WHERE composer_id = 'c1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!((count, first, last), (3, 1000, 3000));

        assert!(matches!(
            db.store_message(&message("bx", 1, "x"), "ghost").await,
            Err(DbError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_conversation_appends_suffix() {
        let db = db_with_session("s1").await;
        db.store_conversation(
            &conversation("c1", vec![message("b1", 1000, "one")]),
            "s1",
        )
        .await
        .unwrap();

        db.update_conversation(
            "c1",
            &[message("b2", 2000, "two"), message("b3", 3000, "three")],
        )
        .await
        .unwrap();

        assert_eq!(db.stored_message_count("c1").await.unwrap(), 3);
        let (count, last): (i64, i64) = sqlx::query_as(
            "SELECT message_count, last_message_time FROM conversations WHERE composer_id = 'c1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!((count, last), (3, 3000));

        // Empty batch is a no-op
        db.update_conversation("c1", &[]).await.unwrap();
        assert_eq!(db.stored_message_count("c1").await.unwrap(), 3);

        assert!(matches!(
            db.update_conversation("ghost", &[message("b", 1, "x")]).await,
            Err(DbError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rich_message_round_trip() {
        let db = db_with_session("s1").await;
        let mut metadata = Map::new();
        metadata.insert("capabilities".to_string(), serde_json::json!({"v": 2}));
        let msg = Message {
            bubble_id: "b1".to_string(),
            msg_type: 2,
            role: Role::Assistant,
            text: "answer".to_string(),
            thinking_text: Some("hmm".to_string()),
            code_blocks: vec![CodeBlock {
                content: "let x = 1;".to_string(),
                language_id: Some("rust".to_string()),
                index: 0,
            }],
            tool_calls: vec![ToolCall {
                name: "read_file".to_string(),
                status: Some("completed".to_string()),
                index: 0,
            }],
            content_source: ContentSource::Mixed,
            created_at: 1000,
            metadata,
        };
        db.store_conversation(&conversation("c1", vec![msg.clone()]), "s1")
            .await
            .unwrap();

        let loaded = db.get_conversation_messages("c1").await.unwrap();
        assert_eq!(loaded, vec![msg]);
    }

    #[tokio::test]
    async fn test_empty_metadata_persists_as_null() {
        let db = db_with_session("s1").await;
        db.store_conversation(
            &conversation("c1", vec![message("b1", 1000, "plain")]),
            "s1",
        )
        .await
        .unwrap();

        let (metadata, code_blocks): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT metadata, code_blocks FROM messages WHERE bubble_id = 'b1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(metadata, None);
        assert_eq!(code_blocks, None);
    }

    #[tokio::test]
    async fn test_undecodable_row_is_skipped() {
        let db = db_with_session("s1").await;
        db.store_conversation(
            &conversation(
                "c1",
                vec![message("b1", 1000, "good"), message("b2", 2000, "bad")],
            ),
            "s1",
        )
        .await
        .unwrap();

        // Corrupt one row's JSON column behind the API's back
        sqlx::query("UPDATE messages SET code_blocks = '{not json' WHERE bubble_id = 'b2'")
            .execute(db.pool())
            .await
            .unwrap();

        let loaded = db.get_conversation_messages("c1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text, "good");
    }

    #[tokio::test]
    async fn test_get_session_conversations() {
        let db = db_with_session("s1").await;
        db.store_conversation(
            &Conversation {
                created_at: 2000,
                ..conversation("c2", vec![message("b2", 2000, "later")])
            },
            "s1",
        )
        .await
        .unwrap();
        db.store_conversation(
            &Conversation {
                created_at: 1000,
                ..conversation("c1", vec![message("b1", 1000, "earlier")])
            },
            "s1",
        )
        .await
        .unwrap();

        let convs = db.get_session_conversations("s1").await.unwrap();
        let ids: Vec<&str> = convs.iter().map(|c| c.composer_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(convs[0].messages.len(), 1);
    }
}
