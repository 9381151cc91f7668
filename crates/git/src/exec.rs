// crates/git/src/exec.rs
//! Git subprocess plumbing: every git invocation goes through here, with a
//! hard timeout and transient-error retries.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Timeout for a single git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error-text fragments treated as transient and worth a retry.
const TRANSIENT_MARKERS: &[&str] = &[
    "locked",
    "busy",
    "temporary",
    "timeout",
    "connection",
    "network",
];

/// Retry delays for transient failures.
const RETRY_DELAYS: &[Duration] = &[
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(200),
];

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Git operation timed out")]
    Timeout,

    #[error("Git exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("Unexpected git output: {0}")]
    BadOutput(String),

    #[error("Poller already started")]
    AlreadyStarted,
}

impl GitError {
    /// Whether this failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        let text = self.to_string().to_lowercase();
        matches!(self, GitError::Timeout)
            || TRANSIENT_MARKERS.iter().any(|m| text.contains(m))
    }
}

/// Run git in `repo` and return stdout. Non-zero exit or timeout is an
/// error; stderr rides along in the error text.
pub async fn run_git(repo: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| GitError::Timeout)??;

    if !output.status.success() {
        return Err(GitError::Failed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// [`run_git`] with up to three retries on transient failures
/// (50 → 100 → 200 ms).
pub async fn run_git_retry(repo: &Path, args: &[&str]) -> Result<String, GitError> {
    let mut last_err = None;
    for (attempt, delay) in [Duration::ZERO]
        .iter()
        .chain(RETRY_DELAYS.iter())
        .enumerate()
    {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        match run_git(repo, args).await {
            Ok(out) => return Ok(out),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "transient git failure, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}
