// crates/core/src/paths.rs
//! Path layout of the editor's storage tree.
//!
//! Single source of truth — avoids ad-hoc `log_path.join(...)` scattered
//! across the parser, detector, and watcher.

use std::path::{Path, PathBuf};

/// Filename of the editor's SQLite key-value stores.
pub const STATE_DB_FILENAME: &str = "state.vscdb";

/// The editor's global database: `{log_path}/globalStorage/state.vscdb`.
pub fn global_db_path(log_path: &Path) -> PathBuf {
    log_path.join("globalStorage").join(STATE_DB_FILENAME)
}

/// The per-workspace storage root: `{log_path}/workspaceStorage/`.
pub fn workspace_storage_dir(log_path: &Path) -> PathBuf {
    log_path.join("workspaceStorage")
}

/// A single workspace's own database:
/// `{log_path}/workspaceStorage/{hash}/state.vscdb`.
pub fn workspace_db_path(log_path: &Path, workspace_hash: &str) -> PathBuf {
    workspace_storage_dir(log_path)
        .join(workspace_hash)
        .join(STATE_DB_FILENAME)
}

/// A workspace's metadata file:
/// `{log_path}/workspaceStorage/{hash}/workspace.json`.
pub fn workspace_json_path(log_path: &Path, workspace_hash: &str) -> PathBuf {
    workspace_storage_dir(log_path)
        .join(workspace_hash)
        .join("workspace.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_db_path() {
        let p = global_db_path(Path::new("/data/cursor"));
        assert_eq!(
            p,
            Path::new("/data/cursor/globalStorage/state.vscdb")
        );
    }

    #[test]
    fn test_workspace_paths() {
        let base = Path::new("/data/cursor");
        assert_eq!(
            workspace_db_path(base, "abc123"),
            Path::new("/data/cursor/workspaceStorage/abc123/state.vscdb")
        );
        assert_eq!(
            workspace_json_path(base, "abc123"),
            Path::new("/data/cursor/workspaceStorage/abc123/workspace.json")
        );
    }
}
