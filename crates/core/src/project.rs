// crates/core/src/project.rs
//! Resolves conversations to normalized project names.
//!
//! The editor keeps a per-workspace directory keyed by an opaque hash; each
//! one records its folder in `workspace.json` and its composer ids in its
//! own key-value store. `refresh()` rebuilds two maps from that layout:
//!
//! - workspace hash → project path
//! - composer id → workspace hash
//!
//! `detect()` walks composer → hash → path; any miss yields `"unknown"`.

use crate::error::DetectError;
use crate::paths;
use crate::store;
use hindsight_types::Conversation;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Fallback project name when detection fails at any step.
pub const UNKNOWN_PROJECT: &str = "unknown";

/// Maximum length of a normalized project name.
const MAX_PROJECT_NAME_LEN: usize = 255;

#[derive(Debug, Default)]
struct DetectorCache {
    workspace_to_project: HashMap<String, String>,
    composer_to_workspace: HashMap<String, String>,
}

/// Project-detection cache over the editor's workspace storage.
#[derive(Debug)]
pub struct ProjectDetector {
    log_path: PathBuf,
    cache: RwLock<DetectorCache>,
}

impl ProjectDetector {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            cache: RwLock::new(DetectorCache::default()),
        }
    }

    /// Rebuild both maps from the per-workspace directories.
    ///
    /// A workspace missing its `workspace.json` or its own store is skipped;
    /// only an unreadable workspace-storage root is an error.
    pub async fn refresh(&self) -> Result<(), DetectError> {
        let storage_dir = paths::workspace_storage_dir(&self.log_path);
        let entries =
            std::fs::read_dir(&storage_dir).map_err(|source| DetectError::WorkspaceStorage {
                path: storage_dir.clone(),
                source,
            })?;

        let mut fresh = DetectorCache::default();

        for entry in entries.flatten() {
            let workspace_dir = entry.path();
            if !workspace_dir.is_dir() {
                continue;
            }
            let Some(hash) = workspace_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
            else {
                continue;
            };

            match read_workspace_folder(&workspace_dir) {
                Some(folder) => {
                    fresh.workspace_to_project.insert(hash.clone(), folder);
                }
                None => {
                    debug!(workspace = %hash, "no workspace.json folder, skipping");
                    continue;
                }
            }

            for composer_id in read_workspace_composers(&self.log_path, &hash) {
                fresh.composer_to_workspace.insert(composer_id, hash.clone());
            }
        }

        let mut cache = self.cache.write().await;
        *cache = fresh;
        debug!(
            workspaces = cache.workspace_to_project.len(),
            composers = cache.composer_to_workspace.len(),
            "project cache refreshed"
        );
        Ok(())
    }

    /// Resolve a conversation to its normalized project name.
    pub async fn detect(&self, conversation: &Conversation) -> String {
        let cache = self.cache.read().await;
        let project = cache
            .composer_to_workspace
            .get(&conversation.composer_id)
            .and_then(|hash| cache.workspace_to_project.get(hash));

        match project {
            Some(path) => normalize_project_name(path),
            None => UNKNOWN_PROJECT.to_string(),
        }
    }

    /// Number of composer ids currently mapped.
    pub async fn known_composers(&self) -> usize {
        self.cache.read().await.composer_to_workspace.len()
    }
}

/// Read the `folder` field of a workspace's `workspace.json`.
fn read_workspace_folder(workspace_dir: &Path) -> Option<String> {
    let raw = std::fs::read(workspace_dir.join("workspace.json")).ok()?;
    let value: Value = serde_json::from_slice(&raw).ok()?;
    value
        .get("folder")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Read composer ids out of a workspace's own key-value store.
fn read_workspace_composers(log_path: &Path, workspace_hash: &str) -> Vec<String> {
    let db_path = paths::workspace_db_path(log_path, workspace_hash);
    if !db_path.exists() {
        return Vec::new();
    }

    let conn = match store::open_read_only(&db_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(workspace = %workspace_hash, error = %e, "cannot open workspace store");
            return Vec::new();
        }
    };

    let raw = match store::get_item(&conn, "composer.composerData") {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(workspace = %workspace_hash, error = %e, "cannot read composer data");
            return Vec::new();
        }
    };

    let value: Value = match serde_json::from_slice(&raw) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    value
        .get("allComposers")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|c| c.get("composerId"))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Normalize a project path or folder URI to a storable project name.
///
/// `file://` URIs are decoded to their path component first, then the
/// basename is sanitized: characters outside `[A-Za-z0-9._-]` become `-`,
/// lowercased, runs of `-` collapse, edge `-` trimmed, capped at 255 chars.
/// Anything that sanitizes away entirely becomes `"unknown"`.
pub fn normalize_project_name(name: &str) -> String {
    let path = if let Some(rest) = name.strip_prefix("file://") {
        // Strip an authority component if present; decode percent escapes.
        let path_part = match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => rest,
        };
        urlencoding::decode(path_part)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| path_part.to_string())
    } else {
        name.to_string()
    };

    let basename = Path::new(path.trim_end_matches('/'))
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let sanitized: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut collapsed = String::with_capacity(sanitized.len());
    let mut last_dash = false;
    for c in sanitized.chars() {
        if c == '-' {
            if !last_dash {
                collapsed.push(c);
            }
            last_dash = true;
        } else {
            collapsed.push(c);
            last_dash = false;
        }
    }

    let trimmed = collapsed.trim_matches('-');
    let truncated: String = trimmed.chars().take(MAX_PROJECT_NAME_LEN).collect();

    if truncated.is_empty() {
        UNKNOWN_PROJECT.to_string()
    } else {
        truncated
    }
}
