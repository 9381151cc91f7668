// crates/core/src/config.rs
//! The validated configuration record the daemon shell hands to the core.
//!
//! Loading (file discovery, format, merging) lives outside the core; this
//! module owns the shape, the defaults, home expansion, and the validation
//! rules every consumer relies on.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory roots that must never be watched, including their subtrees.
pub const SENSITIVE_ROOTS: &[&str] = &[
    "/etc", "/usr", "/bin", "/sys", "/proc", "/dev", "/boot", "/root", "/var/log", "/var/run",
    "/tmp", "/var/tmp",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Watched directory does not exist or is not a directory: {0}")]
    MissingDirectory(String),

    #[error("Watched directory is not readable: {0}")]
    UnreadableDirectory(String),

    #[error("Watched directory is outside the home directory: {0}")]
    OutsideHome(String),

    #[error("Watched directory is under a sensitive system root: {0}")]
    SensitiveDirectory(String),

    #[error("Blog repository is not a directory: {0}")]
    BlogRepositoryInvalid(String),

    #[error("Database parent directory does not exist: {0}")]
    DatabaseParentMissing(String),

    #[error("Database parent directory is not writable: {0}")]
    DatabaseParentReadOnly(String),

    #[error("Editor log path is not a readable directory: {0}")]
    CursorLogPathInvalid(String),

    #[error("Editor log path is missing its {subdir}/ directory: {path}")]
    CursorLayoutInvalid { path: String, subdir: String },

    #[error("{field} must be at least {min}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        value: i64,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub sessions_path: PathBuf,
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("~/.hindsight"),
            sessions_path: PathBuf::from("~/.hindsight/sessions"),
            database_path: PathBuf::from("~/.hindsight/hindsight.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CursorConfig {
    /// Directory holding the editor's `globalStorage/` and
    /// `workspaceStorage/` trees.
    pub log_path: PathBuf,
    pub poll_interval_seconds: i64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("~/.config/Cursor/User"),
            poll_interval_seconds: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub inactivity_timeout_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_minutes: 30,
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs((self.inactivity_timeout_minutes.max(0) as u64) * 60)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub poll_interval_seconds: i64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
        }
    }
}

impl GitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1) as u64)
    }
}

/// Presentation-layer logging options. Carried through the config record
/// for the daemon shell; the core only emits `tracing` events.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<PathBuf>,
    pub console: bool,
    pub max_size: u64,
    pub max_backups: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            console: true,
            max_size: 50,
            max_backups: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub watched_directories: Vec<PathBuf>,
    pub blog_repository: Option<PathBuf>,
    pub storage: StorageConfig,
    pub cursor: CursorConfig,
    pub session: SessionConfig,
    pub git: GitConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Expand a leading `~` in every configured path against `home`.
    pub fn expand_home(&mut self, home: &Path) {
        for path in [
            &mut self.storage.base_path,
            &mut self.storage.sessions_path,
            &mut self.storage.database_path,
            &mut self.cursor.log_path,
        ] {
            *path = expand_tilde(path, home);
        }
        for dir in &mut self.watched_directories {
            *dir = expand_tilde(dir, home);
        }
        if let Some(blog) = &mut self.blog_repository {
            *blog = expand_tilde(blog, home);
        }
        if let Some(log_file) = &mut self.logging.file_path {
            *log_file = expand_tilde(log_file, home);
        }
    }

    /// Validate against the standard sensitive-root list.
    pub fn validate(&self, home: &Path) -> Result<(), ConfigError> {
        self.validate_with(home, SENSITIVE_ROOTS)
    }

    /// Validation with an explicit sensitive-root list (tests substitute
    /// their own).
    pub fn validate_with(
        &self,
        home: &Path,
        sensitive_roots: &[&str],
    ) -> Result<(), ConfigError> {
        for dir in &self.watched_directories {
            let display = dir.display().to_string();
            if !dir.is_dir() {
                return Err(ConfigError::MissingDirectory(display));
            }
            if std::fs::read_dir(dir).is_err() {
                return Err(ConfigError::UnreadableDirectory(display));
            }
            if !dir.starts_with(home) {
                return Err(ConfigError::OutsideHome(display));
            }
            if sensitive_roots.iter().any(|root| dir.starts_with(root)) {
                return Err(ConfigError::SensitiveDirectory(display));
            }
        }

        if let Some(blog) = &self.blog_repository {
            if !blog.is_dir() {
                return Err(ConfigError::BlogRepositoryInvalid(
                    blog.display().to_string(),
                ));
            }
        }

        match self.storage.database_path.parent() {
            Some(parent) if parent.is_dir() => {
                let writable = std::fs::metadata(parent)
                    .map(|m| !m.permissions().readonly())
                    .unwrap_or(false);
                if !writable {
                    return Err(ConfigError::DatabaseParentReadOnly(
                        parent.display().to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::DatabaseParentMissing(
                    other
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| self.storage.database_path.display().to_string()),
                ));
            }
        }

        let log_path = &self.cursor.log_path;
        if !log_path.is_dir() || std::fs::read_dir(log_path).is_err() {
            return Err(ConfigError::CursorLogPathInvalid(
                log_path.display().to_string(),
            ));
        }
        for subdir in ["globalStorage", "workspaceStorage"] {
            if !log_path.join(subdir).is_dir() {
                return Err(ConfigError::CursorLayoutInvalid {
                    path: log_path.display().to_string(),
                    subdir: subdir.to_string(),
                });
            }
        }

        for (field, min, value) in [
            (
                "cursor.poll_interval_seconds",
                1,
                self.cursor.poll_interval_seconds,
            ),
            (
                "git.poll_interval_seconds",
                1,
                self.git.poll_interval_seconds,
            ),
            (
                "session.inactivity_timeout_minutes",
                1,
                self.session.inactivity_timeout_minutes,
            ),
        ] {
            if value < min {
                return Err(ConfigError::OutOfRange { field, min, value });
            }
        }

        Ok(())
    }
}

fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
