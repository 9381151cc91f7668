// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors from reading the editor's key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open editor store: {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Editor store still busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Key not found in editor store: {key}")]
    MissingKey { key: String },

    #[error("SQLite error reading editor store: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Errors from decoding conversation data out of the editor store.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No composer data for conversation {composer_id}")]
    MissingComposer { composer_id: String },

    #[error("Corrupt composer data for conversation {composer_id}: {message}")]
    CorruptComposer {
        composer_id: String,
        message: String,
    },
}

/// Errors from the project-detection cache refresh.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Cannot read workspace storage directory: {path}")]
    WorkspaceStorage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the database file watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watcher already started")]
    AlreadyStarted,

    #[error("Watch target parent directory does not exist: {path}")]
    ParentMissing { path: PathBuf },

    #[error("Event stream already taken")]
    EventsTaken,

    #[error("File notification error: {0}")]
    Notify(#[from] notify::Error),
}

/// Replace the user's home directory prefix with `~` in error text bound
/// for external consumers.
pub fn sanitize_home(text: &str) -> String {
    match dirs::home_dir() {
        Some(home) => text.replace(&home.to_string_lossy().to_string(), "~"),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::MissingKey {
            key: "composerData:abc".to_string(),
        };
        assert!(err.to_string().contains("composerData:abc"));

        let err = StoreError::Busy { attempts: 5 };
        assert!(err.to_string().contains("5"));
    }

    #[test]
    fn test_parse_error_wraps_store_error() {
        let err: ParseError = StoreError::Busy { attempts: 3 }.into();
        assert!(matches!(err, ParseError::Store(_)));
    }

    #[test]
    fn test_sanitize_home_replaces_prefix() {
        if let Some(home) = dirs::home_dir() {
            let raw = format!("failed to read {}/secret/file", home.display());
            let cleaned = sanitize_home(&raw);
            assert!(cleaned.contains("~/secret/file"));
            assert!(!cleaned.contains(&home.to_string_lossy().to_string()));
        }
    }
}
