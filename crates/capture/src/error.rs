// crates/capture/src/error.rs
use hindsight_core::{ParseError, StoreError, WatchError};
use hindsight_db::DbError;
use thiserror::Error;

/// Errors surfaced by the capture pipeline.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Session does not exist: {0}")]
    SessionNotFound(String),

    #[error("Session already ended: {0}")]
    SessionEnded(String),

    #[error("Inactivity monitor already running")]
    MonitorAlreadyRunning,
}
