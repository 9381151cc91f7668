// crates/core/src/store.rs
//! Read-only access to the editor's SQLite key-value stores.
//!
//! Every operation opens a fresh handle with `SQLITE_OPEN_READ_ONLY` — this
//! process never writes to the editor's databases, and no handle is held
//! across an await. BUSY/LOCKED contention from the editor's own writer is
//! absorbed with capped exponential backoff.

use crate::error::StoreError;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Base delay for BUSY backoff; doubles per attempt.
const BUSY_BASE_DELAY: Duration = Duration::from_millis(50);
/// Backoff ceiling.
const BUSY_MAX_DELAY: Duration = Duration::from_secs(2);
/// Attempts before giving up on a busy store.
const BUSY_MAX_ATTEMPTS: u32 = 5;

/// Open an editor store read-only.
pub fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// True when the error is SQLite reporting writer contention.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Open the store at `path` and run `op` against it, retrying on BUSY with
/// exponential backoff (50 ms doubling, capped at 2 s, up to 5 attempts).
///
/// A fresh read-only handle is opened per attempt and dropped before any
/// backoff sleep, so the returned future stays `Send`.
pub async fn with_busy_retry<T, F>(path: &Path, mut op: F) -> Result<T, StoreError>
where
    F: FnMut(&Connection) -> rusqlite::Result<T>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome: Result<T, (bool, StoreError)> = match open_read_only(path) {
            Ok(conn) => op(&conn).map_err(|e| (is_busy(&e), StoreError::from(e))),
            Err(StoreError::Open { path: p, source }) if is_busy(&source) => {
                Err((true, StoreError::Open { path: p, source }))
            }
            Err(e) => return Err(e),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err((true, _)) => {
                attempt += 1;
                if attempt >= BUSY_MAX_ATTEMPTS {
                    return Err(StoreError::Busy {
                        attempts: BUSY_MAX_ATTEMPTS,
                    });
                }
                let delay = BUSY_BASE_DELAY
                    .saturating_mul(1 << (attempt - 1))
                    .min(BUSY_MAX_DELAY);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "editor store busy, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err((false, e)) => return Err(e.into()),
        }
    }
}

/// Decode a key-value blob that may be stored as TEXT or BLOB.
pub fn value_bytes(value: ValueRef<'_>) -> Option<Vec<u8>> {
    match value {
        ValueRef::Text(t) => Some(t.to_vec()),
        ValueRef::Blob(b) => Some(b.to_vec()),
        _ => None,
    }
}

/// Fetch one value from the global `cursorDiskKV` table.
///
/// Returns `Ok(None)` when the key is absent.
pub fn get_kv(conn: &Connection, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare("SELECT value FROM cursorDiskKV WHERE key = ?1")?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(value_bytes(row.get_ref(0)?)),
        None => Ok(None),
    }
}

/// List all keys in `cursorDiskKV` matching a LIKE pattern.
pub fn list_kv_keys(conn: &Connection, pattern: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT key FROM cursorDiskKV WHERE key LIKE ?1")?;
    let rows = stmt.query_map([pattern], |row| row.get::<_, String>(0))?;
    rows.collect()
}

/// Fetch one value from a workspace store's `ItemTable`.
pub fn get_item(conn: &Connection, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare("SELECT value FROM ItemTable WHERE key = ?1")?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(value_bytes(row.get_ref(0)?)),
        None => Ok(None),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_global_store(&path);

        let conn = open_read_only(&path).unwrap();
        let result = conn.execute(
            "INSERT INTO cursorDiskKV (key, value) VALUES ('k', 'v')",
            [],
        );
        assert!(result.is_err(), "read-only handle must reject writes");
    }

    #[test]
    fn test_get_kv_text_and_blob() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        let writer = create_global_store(&path);
        put_kv(&writer, "composerData:abc", r#"{"composerId":"abc"}"#);
        // TEXT-typed value
        writer
            .execute(
                "INSERT INTO cursorDiskKV (key, value) VALUES ('text-key', 'hello')",
                [],
            )
            .unwrap();

        let conn = open_read_only(&path).unwrap();
        let blob = get_kv(&conn, "composerData:abc").unwrap().unwrap();
        assert_eq!(blob, br#"{"composerId":"abc"}"#);

        let text = get_kv(&conn, "text-key").unwrap().unwrap();
        assert_eq!(text, b"hello");

        assert!(get_kv(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_list_kv_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        let writer = create_global_store(&path);
        put_kv(&writer, "composerData:one", "{}");
        put_kv(&writer, "composerData:two", "{}");
        put_kv(&writer, "bubbleId:one:b1", "{}");

        let conn = open_read_only(&path).unwrap();
        let mut keys = list_kv_keys(&conn, "composerData:%").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["composerData:one", "composerData:two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_retry_exhausts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_global_store(&path);

        // Paused clock auto-advances through the backoff sleeps
        let result = with_busy_retry(&path, |_| -> rusqlite::Result<()> {
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Busy { attempts: 5 })));
    }

    #[tokio::test]
    async fn test_busy_retry_recovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_global_store(&path);

        let mut failures_left = 2;
        let result = with_busy_retry(&path, move |_| -> rusqlite::Result<i64> {
            if failures_left > 0 {
                failures_left -= 1;
                Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    None,
                ))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_busy_retry_passes_through_other_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vscdb");
        create_global_store(&path);

        let result = with_busy_retry(&path, |conn| {
            conn.query_row("SELECT value FROM no_such_table", [], |r| {
                r.get::<_, String>(0)
            })
        })
        .await;
        assert!(matches!(result, Err(StoreError::Query(_))));
    }
}
