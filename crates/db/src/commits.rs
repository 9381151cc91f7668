// crates/db/src/commits.rs
//! Normalized persistence of commits and their per-file changes.
//!
//! A commit row is created once per hash and treated as immutable; the
//! upsert still rewrites every field so a damaged row heals on the next
//! store. File rows are replaced wholesale (delete-then-insert) inside the
//! same transaction.

use crate::{Database, DbError, DbResult};
use hindsight_types::{Commit, CommitDiff, CommitFile, Correlation, CorrelationType};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

/// A stored commit: metadata, correlation outcome, diff accounting, files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub commit: Commit,
    pub session_id: Option<String>,
    pub correlation_type: CorrelationType,
    pub time_delta_seconds: Option<i64>,
    pub full_diff: Option<String>,
    pub diff_truncated: bool,
    pub diff_total_lines: Option<i64>,
    pub diff_shown_lines: Option<i64>,
    pub files: Vec<CommitFile>,
}

fn commit_record_from_row(row: &SqliteRow) -> Result<CommitRecord, sqlx::Error> {
    let parent_hashes_raw: String = row.try_get("parent_hashes")?;
    let correlation_type: String = row.try_get("correlation_type")?;
    Ok(CommitRecord {
        commit: Commit {
            hash: row.try_get("hash")?,
            repository_path: row.try_get("repository_path")?,
            repository_name: row.try_get("repository_name")?,
            message: row.try_get("message")?,
            author_name: row.try_get("author_name")?,
            author_email: row.try_get("author_email")?,
            timestamp: row.try_get("timestamp")?,
            branch: row.try_get("branch")?,
            is_merge: row.try_get("is_merge")?,
            parent_hashes: serde_json::from_str(&parent_hashes_raw).unwrap_or_default(),
        },
        session_id: row.try_get("session_id")?,
        correlation_type: CorrelationType::parse(&correlation_type),
        time_delta_seconds: row.try_get("time_delta_seconds")?,
        full_diff: row.try_get("full_diff")?,
        diff_truncated: row.try_get("diff_truncated")?,
        diff_total_lines: row.try_get("diff_total_lines")?,
        diff_shown_lines: row.try_get("diff_shown_lines")?,
        files: Vec::new(),
    })
}

impl Database {
    /// Store a commit with its diff and correlation outcome.
    ///
    /// Fails with [`DbError::SessionNotFound`] when the correlation names a
    /// session that does not exist.
    pub async fn store_commit(
        &self,
        commit: &Commit,
        diff: &CommitDiff,
        correlation: &Correlation,
    ) -> DbResult<()> {
        let session_id = correlation
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty());

        let mut tx = self.pool().begin().await?;

        if let Some(sid) = session_id {
            let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE id = ?")
                .bind(sid)
                .fetch_one(&mut *tx)
                .await?;
            if count.0 == 0 {
                return Err(DbError::SessionNotFound(sid.to_string()));
            }
        }

        let parent_hashes =
            serde_json::to_string(&commit.parent_hashes).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO commits (hash, session_id, repository_path, repository_name,
                                 message, author_name, author_email, timestamp, branch,
                                 is_merge, parent_hashes, full_diff, diff_truncated,
                                 diff_total_lines, diff_shown_lines, correlation_type,
                                 time_delta_seconds)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                session_id = excluded.session_id,
                repository_path = excluded.repository_path,
                repository_name = excluded.repository_name,
                message = excluded.message,
                author_name = excluded.author_name,
                author_email = excluded.author_email,
                timestamp = excluded.timestamp,
                branch = excluded.branch,
                is_merge = excluded.is_merge,
                parent_hashes = excluded.parent_hashes,
                full_diff = excluded.full_diff,
                diff_truncated = excluded.diff_truncated,
                diff_total_lines = excluded.diff_total_lines,
                diff_shown_lines = excluded.diff_shown_lines,
                correlation_type = excluded.correlation_type,
                time_delta_seconds = excluded.time_delta_seconds
            "#,
        )
        .bind(&commit.hash)
        .bind(session_id)
        .bind(&commit.repository_path)
        .bind(&commit.repository_name)
        .bind(&commit.message)
        .bind(&commit.author_name)
        .bind(&commit.author_email)
        .bind(commit.timestamp)
        .bind(&commit.branch)
        .bind(commit.is_merge)
        .bind(parent_hashes)
        .bind(&diff.full_diff)
        .bind(diff.truncated)
        .bind(diff.total_lines)
        .bind(diff.shown_lines)
        .bind(correlation.correlation_type.as_str())
        .bind(correlation.time_delta_seconds)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM commit_files WHERE commit_hash = ?")
            .bind(&commit.hash)
            .execute(&mut *tx)
            .await?;

        for file in &diff.files {
            sqlx::query(
                r#"
                INSERT INTO commit_files (id, commit_hash, file_path, lines_added,
                                          lines_removed, file_diff)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&commit.hash)
            .bind(&file.path)
            .bind(file.additions)
            .bind(file.deletions)
            .bind(&file.diff)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(hash = %commit.hash, files = diff.files.len(), "commit stored");
        Ok(())
    }

    /// Fetch one commit with all of its file rows.
    pub async fn get_commit(&self, hash: &str) -> DbResult<Option<CommitRecord>> {
        let row = sqlx::query("SELECT * FROM commits WHERE hash = ?")
            .bind(hash)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = commit_record_from_row(&row)?;
        record.files = self.get_commit_files(hash).await?;
        Ok(Some(record))
    }

    /// Commits correlated to a session, oldest first.
    pub async fn get_commits_by_session(&self, session_id: &str) -> DbResult<Vec<CommitRecord>> {
        let rows =
            sqlx::query("SELECT * FROM commits WHERE session_id = ? ORDER BY timestamp ASC")
                .bind(session_id)
                .fetch_all(self.pool())
                .await?;
        self.hydrate_commit_rows(rows).await
    }

    /// Commits from one repository, oldest first.
    pub async fn get_commits_by_repository(&self, path: &str) -> DbResult<Vec<CommitRecord>> {
        let rows =
            sqlx::query("SELECT * FROM commits WHERE repository_path = ? ORDER BY timestamp ASC")
                .bind(path)
                .fetch_all(self.pool())
                .await?;
        self.hydrate_commit_rows(rows).await
    }

    async fn hydrate_commit_rows(&self, rows: Vec<SqliteRow>) -> DbResult<Vec<CommitRecord>> {
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = commit_record_from_row(row)?;
            record.files = self.get_commit_files(&record.commit.hash).await?;
            records.push(record);
        }
        Ok(records)
    }

    async fn get_commit_files(&self, hash: &str) -> DbResult<Vec<CommitFile>> {
        let rows = sqlx::query(
            "SELECT * FROM commit_files WHERE commit_hash = ? ORDER BY file_path ASC",
        )
        .bind(hash)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(CommitFile {
                    id: row.try_get("id")?,
                    commit_hash: row.try_get("commit_hash")?,
                    file_path: row.try_get("file_path")?,
                    lines_added: row.try_get("lines_added")?,
                    lines_removed: row.try_get("lines_removed")?,
                    file_diff: row.try_get("file_diff")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }
}
