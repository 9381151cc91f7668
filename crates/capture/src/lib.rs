// crates/capture/src/lib.rs
//! The conversation capture pipeline: session management, incremental
//! updates, and the orchestrator binding watcher events to persistence.

pub mod error;
pub mod orchestrator;
pub mod session;
pub mod updater;

pub use error::CaptureError;
pub use orchestrator::CaptureOrchestrator;
pub use session::SessionManager;
pub use updater::Updater;

/// Current time as Unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
