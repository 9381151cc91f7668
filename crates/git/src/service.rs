// crates/git/src/service.rs
//! Consumes poll results: extract each new commit, correlate it against
//! sessions, and persist. Per-commit failures are contained and logged.

use crate::correlate::CorrelationEngine;
use crate::discovery::discover_repositories;
use crate::exec::GitError;
use crate::extract::extract_commit;
use crate::poller::GitPoller;
use hindsight_capture::SessionManager;
use hindsight_core::Config;
use hindsight_db::{Database, DbError};
use hindsight_types::Repository;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GitCaptureError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Clone)]
pub struct GitCaptureService {
    poller: Arc<GitPoller>,
    correlator: CorrelationEngine,
    db: Database,
}

impl GitCaptureService {
    /// Discover repositories under the watched directories and wire the
    /// poll → extract → correlate → store chain.
    pub fn new(config: &Config, db: Database, sessions: Arc<SessionManager>) -> Self {
        let repos = discover_repositories(&config.watched_directories);
        info!(repos = repos.len(), "git capture covering discovered repositories");
        Self::with_repositories(repos, config.git.poll_interval(), db, sessions)
    }

    /// Wire the chain over an explicit repository list.
    pub fn with_repositories(
        repos: Vec<Repository>,
        poll_interval: std::time::Duration,
        db: Database,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let poller = Arc::new(GitPoller::new(repos, poll_interval));
        let correlator = CorrelationEngine::new(sessions, db.clone());
        Self {
            poller,
            correlator,
            db,
        }
    }

    /// Start polling and consuming results until cancelled.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), GitError> {
        let mut results = self.poller.results().ok_or(GitError::AlreadyStarted)?;
        self.poller.start(cancel).await?;

        let service = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = results.recv() => {
                        let Some(result) = result else { break };
                        if let Some(error) = &result.error {
                            warn!(repo = %result.repository.name, error, "repository poll failed");
                            continue;
                        }
                        for hash in &result.new_commits {
                            if let Err(e) = service.capture_commit(&result.repository, hash).await {
                                warn!(repo = %result.repository.name, hash, error = %e, "failed to capture commit");
                            }
                        }
                    }
                }
            }
            debug!("git capture consumer stopped");
        });

        Ok(())
    }

    /// Extract, correlate, and store one commit.
    pub async fn capture_commit(
        &self,
        repo: &Repository,
        hash: &str,
    ) -> Result<(), GitCaptureError> {
        let (commit, diff) = extract_commit(repo, hash).await?;
        let correlation = self.correlator.correlate(&commit).await;
        self.db.store_commit(&commit, &diff, &correlation).await?;
        debug!(
            hash = %commit.hash,
            correlation = correlation.correlation_type.as_str(),
            "commit captured"
        );
        Ok(())
    }
}
