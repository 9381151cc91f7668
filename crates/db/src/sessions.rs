// crates/db/src/sessions.rs
//! Session persistence. Sessions rows never embed their conversations —
//! the legacy `conversations_json` column is read for migration from old
//! installs and always written back as NULL.

use crate::{now_ms, Database, DbResult};
use hindsight_types::Session;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const UPSERT_SESSION_SQL: &str = r#"
    INSERT INTO sessions (id, project, start_time, end_time, last_activity,
                          created_at, updated_at, conversations_json)
    VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
    ON CONFLICT(id) DO UPDATE SET
        project = excluded.project,
        start_time = excluded.start_time,
        end_time = excluded.end_time,
        last_activity = excluded.last_activity,
        updated_at = excluded.updated_at,
        conversations_json = NULL
"#;

fn session_from_row(row: &SqliteRow) -> Result<Session, sqlx::Error> {
    Ok(Session {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        last_activity: row.try_get("last_activity")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        conversations: Vec::new(),
    })
}

impl Database {
    /// Insert or update one session.
    pub async fn upsert_session(&self, session: &Session) -> DbResult<()> {
        sqlx::query(UPSERT_SESSION_SQL)
            .bind(&session.id)
            .bind(&session.project)
            .bind(session.start_time)
            .bind(session.end_time)
            .bind(session.last_activity)
            .bind(session.created_at)
            .bind(session.updated_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Upsert a batch of sessions in a single transaction.
    pub async fn upsert_sessions(&self, sessions: &[Session]) -> DbResult<()> {
        let mut tx = self.pool().begin().await?;
        for session in sessions {
            sqlx::query(UPSERT_SESSION_SQL)
                .bind(&session.id)
                .bind(&session.project)
                .bind(session.start_time)
                .bind(session.end_time)
                .bind(session.last_activity)
                .bind(session.created_at)
                .bind(session.updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetch one session (without conversations).
    pub async fn get_session(&self, id: &str) -> DbResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(session_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// All sessions ordered by start time, each paired with its legacy
    /// `conversations_json` blob (if any) for read-side migration.
    pub async fn load_sessions(&self) -> DbResult<Vec<(Session, Option<String>)>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY start_time ASC")
            .fetch_all(self.pool())
            .await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let legacy: Option<String> = row.try_get("conversations_json")?;
            sessions.push((session_from_row(&row)?, legacy));
        }
        Ok(sessions)
    }

    /// Sessions for one normalized project name, ordered by start time.
    pub async fn get_sessions_by_project(&self, project: &str) -> DbResult<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE project = ? ORDER BY start_time ASC")
            .bind(project)
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| session_from_row(row).map_err(Into::into))
            .collect()
    }

    /// Mark a session ended if it is not already.
    pub async fn end_session_row(&self, id: &str, end_time: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE sessions SET end_time = ?, updated_at = ? WHERE id = ? AND end_time IS NULL",
        )
        .bind(end_time)
        .bind(now_ms())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use hindsight_types::Session;

    pub fn session(id: &str, project: &str, start: i64) -> Session {
        Session {
            id: id.to_string(),
            project: project.to_string(),
            start_time: start,
            end_time: None,
            last_activity: start,
            created_at: start,
            updated_at: start,
            conversations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::session;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = Database::new_in_memory().await.unwrap();
        let s = session("s1", "proj-a", 1000);
        db.upsert_session(&s).await.unwrap();

        let loaded = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.project, "proj-a");
        assert!(loaded.is_active());
        assert!(db.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let db = Database::new_in_memory().await.unwrap();
        let mut s = session("s1", "proj-a", 1000);
        db.upsert_session(&s).await.unwrap();

        s.end_time = Some(5000);
        s.last_activity = 4000;
        db.upsert_session(&s).await.unwrap();

        let loaded = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.end_time, Some(5000));
        assert_eq!(loaded.last_activity, 4000);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_conversations_json_written_null() {
        let db = Database::new_in_memory().await.unwrap();
        // Simulate a legacy row carrying an embedded conversation blob
        sqlx::query(
            "INSERT INTO sessions (id, project, start_time, last_activity, created_at, updated_at, conversations_json)
             VALUES ('old', 'proj-a', 1, 1, 1, 1, '[{\"composerId\":\"c1\"}]')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let loaded = db.load_sessions().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].1.is_some(), "legacy blob should be readable");

        // Re-persisting through the upsert path clears the blob
        db.upsert_session(&loaded[0].0).await.unwrap();
        let reloaded = db.load_sessions().await.unwrap();
        assert!(reloaded[0].1.is_none());
    }

    #[tokio::test]
    async fn test_project_filter_and_ordering() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_sessions(&[
            session("s2", "proj-a", 2000),
            session("s1", "proj-a", 1000),
            session("s3", "proj-b", 1500),
        ])
        .await
        .unwrap();

        let a = db.get_sessions_by_project("proj-a").await.unwrap();
        assert_eq!(
            a.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2"]
        );
    }

    #[tokio::test]
    async fn test_end_session_row_is_idempotent() {
        let db = Database::new_in_memory().await.unwrap();
        db.upsert_session(&session("s1", "proj-a", 1000))
            .await
            .unwrap();

        db.end_session_row("s1", 9000).await.unwrap();
        let first = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(first.end_time, Some(9000));

        // Second call must not move the end time
        db.end_session_row("s1", 9999).await.unwrap();
        let second = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(second.end_time, Some(9000));
    }
}
