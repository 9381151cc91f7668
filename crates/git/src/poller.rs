// crates/git/src/poller.rs
//! Periodic HEAD polling over the discovered repositories.
//!
//! One ticker; within each tick every repository is polled concurrently
//! and in isolation. New commits are reported oldest-first on a bounded
//! channel; the repository's last-seen hash only advances once its result
//! has been enqueued, so a dropped result is retried on the next tick.

use crate::exec::{run_git_retry, GitError};
use hindsight_types::Repository;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result channel capacity; overflow drops the result with a warning.
const RESULT_BUFFER: usize = 10;

/// Floor for the poll interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of polling one repository on one tick.
#[derive(Debug)]
pub struct PollResult {
    pub repository: Repository,
    /// New commit hashes in chronological (ancestor-first) order.
    pub new_commits: Vec<String>,
    pub error: Option<String>,
}

pub struct GitPoller {
    repos: Vec<Repository>,
    interval: Duration,
    last_seen: Arc<Mutex<HashMap<PathBuf, String>>>,
    results_tx: mpsc::Sender<PollResult>,
    results_rx: std::sync::Mutex<Option<mpsc::Receiver<PollResult>>>,
    started: std::sync::Mutex<bool>,
}

impl GitPoller {
    pub fn new(repos: Vec<Repository>, interval: Duration) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_BUFFER);
        Self {
            repos,
            interval: interval.max(MIN_POLL_INTERVAL),
            last_seen: Arc::new(Mutex::new(HashMap::new())),
            results_tx,
            results_rx: std::sync::Mutex::new(Some(results_rx)),
            started: std::sync::Mutex::new(false),
        }
    }

    /// Take the poll-result stream. Can only be taken once.
    pub fn results(&self) -> Option<mpsc::Receiver<PollResult>> {
        self.results_rx.lock().expect("poller lock poisoned").take()
    }

    /// Snapshot the tracked HEAD for a repository (tests and diagnostics).
    pub async fn last_seen(&self, repo_path: &Path) -> Option<String> {
        self.last_seen.lock().await.get(repo_path).cloned()
    }

    /// Record current HEADs and start the ticker.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), GitError> {
        {
            let mut started = self.started.lock().expect("poller lock poisoned");
            if *started {
                return Err(GitError::AlreadyStarted);
            }
            *started = true;
        }

        // Baseline: whatever is at HEAD now has already happened.
        {
            let mut map = self.last_seen.lock().await;
            for repo in &self.repos {
                match resolve_head(&repo.path).await {
                    Ok(Some(head)) => {
                        map.insert(repo.path.clone(), head);
                    }
                    Ok(None) => {
                        debug!(repo = %repo.name, "repository has no HEAD yet");
                    }
                    Err(e) => {
                        warn!(repo = %repo.name, error = %e, "cannot resolve HEAD at startup");
                    }
                }
            }
        }

        let repos = self.repos.clone();
        let interval = self.interval;
        let last_seen = Arc::clone(&self.last_seen);
        let results_tx = self.results_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => poll_all(&repos, &last_seen, &results_tx).await,
                }
            }
            debug!("git poller stopped");
        });

        info!(repos = self.repos.len(), interval = ?self.interval, "git poller started");
        Ok(())
    }
}

/// One tick: poll every repository concurrently.
async fn poll_all(
    repos: &[Repository],
    last_seen: &Arc<Mutex<HashMap<PathBuf, String>>>,
    results_tx: &mpsc::Sender<PollResult>,
) {
    let mut set = JoinSet::new();
    for repo in repos.to_vec() {
        let last_seen = Arc::clone(last_seen);
        set.spawn(async move {
            let last = last_seen.lock().await.get(&repo.path).cloned();
            poll_repository(repo, last).await
        });
    }

    while let Some(joined) = set.join_next().await {
        let outcome = match joined {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "repository poll task panicked");
                continue;
            }
        };
        let Some((result, new_head)) = outcome else {
            continue;
        };

        let path = result.repository.path.clone();
        match results_tx.try_send(result) {
            Ok(()) => {
                if let Some(head) = new_head {
                    last_seen.lock().await.insert(path, head);
                }
            }
            Err(_) => {
                // Not advancing last_seen means these commits are
                // rediscovered next tick.
                warn!(repo = %path.display(), "poll result channel full, dropping result");
            }
        }
    }
}

/// Poll one repository. `None` means nothing to report this tick.
/// The second tuple element is the HEAD to record once the result is
/// enqueued (absent for error results).
async fn poll_repository(
    repo: Repository,
    last_seen: Option<String>,
) -> Option<(PollResult, Option<String>)> {
    let head = match resolve_head(&repo.path).await {
        Ok(Some(head)) => head,
        Ok(None) => return None,
        Err(e) => {
            return Some((
                PollResult {
                    repository: repo,
                    new_commits: Vec::new(),
                    error: Some(e.to_string()),
                },
                None,
            ));
        }
    };

    if last_seen.as_deref() == Some(head.as_str()) {
        return None;
    }

    match list_new_commits(&repo.path, last_seen.as_deref(), &head).await {
        Ok(new_commits) => {
            debug!(repo = %repo.name, count = new_commits.len(), "new commits found");
            Some((
                PollResult {
                    repository: repo,
                    new_commits,
                    error: None,
                },
                Some(head),
            ))
        }
        Err(e) => Some((
            PollResult {
                repository: repo,
                new_commits: Vec::new(),
                error: Some(e.to_string()),
            },
            None,
        )),
    }
}

/// Current HEAD hash, or `None` for an empty repository.
pub(crate) async fn resolve_head(repo: &Path) -> Result<Option<String>, GitError> {
    match run_git_retry(repo, &["rev-parse", "--verify", "--quiet", "HEAD"]).await {
        Ok(out) => {
            let head = out.trim().to_string();
            Ok(if head.is_empty() { None } else { Some(head) })
        }
        // --quiet exits 1 with no stderr on an unborn branch
        Err(GitError::Failed { stderr, .. }) if stderr.is_empty() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Hashes from `last..head`, ancestor-first. When the recorded hash has
/// vanished (rebase, gc) the walk falls back to full history.
async fn list_new_commits(
    repo: &Path,
    last: Option<&str>,
    head: &str,
) -> Result<Vec<String>, GitError> {
    let output = match last {
        Some(last) => {
            let range = format!("{last}..{head}");
            match run_git_retry(repo, &["rev-list", "--reverse", &range]).await {
                Ok(out) => out,
                Err(GitError::Failed { stderr, .. })
                    if stderr.contains("unknown revision") || stderr.contains("bad revision") =>
                {
                    warn!(repo = %repo.display(), "recorded hash no longer reachable, walking full history");
                    run_git_retry(repo, &["rev-list", "--reverse", head]).await?
                }
                Err(e) => return Err(e),
            }
        }
        None => run_git_retry(repo, &["rev-list", "--reverse", head]).await?,
    };

    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::*;
    use tempfile::tempdir;

    fn repo_record(path: &Path) -> Repository {
        Repository {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            git_dir: path.join(".git"),
            is_worktree: false,
        }
    }

    #[tokio::test]
    async fn test_resolve_head_empty_repo() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        // No commits: no HEAD, no error
        assert_eq!(resolve_head(dir.path()).await.unwrap(), None);

        commit_file(dir.path(), "a.txt", "x\n", "first");
        assert!(resolve_head(dir.path()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_poll_repository_reports_new_commits_oldest_first() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let first = commit_file(dir.path(), "a.txt", "1\n", "first");
        let second = commit_file(dir.path(), "a.txt", "2\n", "second");
        let third = commit_file(dir.path(), "a.txt", "3\n", "third");

        let (result, new_head) = poll_repository(repo_record(dir.path()), Some(first.clone()))
            .await
            .expect("growth must produce a result");
        assert_eq!(result.new_commits, vec![second, third.clone()]);
        assert_eq!(result.error, None);
        assert_eq!(new_head, Some(third));
    }

    #[tokio::test]
    async fn test_poll_repository_skips_when_unchanged() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let head = commit_file(dir.path(), "a.txt", "1\n", "first");

        assert!(poll_repository(repo_record(dir.path()), Some(head))
            .await
            .is_none());
        // Empty repository also produces nothing
        let empty = tempdir().unwrap();
        init_repo(empty.path());
        assert!(poll_repository(repo_record(empty.path()), None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_poll_repository_without_baseline_walks_history() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let first = commit_file(dir.path(), "a.txt", "1\n", "first");
        let second = commit_file(dir.path(), "a.txt", "2\n", "second");

        let (result, _) = poll_repository(repo_record(dir.path()), None)
            .await
            .unwrap();
        assert_eq!(result.new_commits, vec![first, second]);
    }

    #[tokio::test]
    async fn test_poller_end_to_end() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "a.txt", "1\n", "first");

        let poller = Arc::new(GitPoller::new(
            vec![repo_record(dir.path())],
            Duration::from_millis(1100),
        ));
        let mut results = poller.results().expect("stream taken once");
        assert!(poller.results().is_none());

        let cancel = CancellationToken::new();
        poller.start(&cancel).await.unwrap();
        assert!(matches!(
            poller.start(&cancel).await,
            Err(GitError::AlreadyStarted)
        ));

        // Baseline was recorded at start; this commit is the only delta
        let new_hash = commit_file(dir.path(), "b.txt", "2\n", "second");

        let result = tokio::time::timeout(Duration::from_secs(10), results.recv())
            .await
            .expect("poll tick should deliver")
            .expect("channel open");
        assert_eq!(result.new_commits, vec![new_hash.clone()]);
        assert_eq!(poller.last_seen(dir.path()).await, Some(new_hash));

        cancel.cancel();
    }
}
