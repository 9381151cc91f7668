// crates/capture/src/orchestrator.rs
//! Binds watcher events to the parse → classify → persist → mark-processed
//! pipeline, after an initial reconciliation scan of the editor store.
//!
//! Every watcher event fans out into its own tracked task; failures stay
//! contained to the composer they belong to. Shutdown cancels the root
//! token, stops the watcher, saves sessions, and waits a bounded 10 s for
//! in-flight handlers.

use crate::session::SessionManager;
use crate::updater::Updater;
use crate::CaptureError;
use hindsight_core::{
    paths, project::UNKNOWN_PROJECT, Config, DbWatcher, Parser, ProjectDetector, WatchEvent,
};
use hindsight_db::Database;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long shutdown waits for in-flight event handlers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How many initial-scan items between progress lines.
const SCAN_PROGRESS_EVERY: usize = 25;

/// The per-composer capture pipeline, cheap to clone into event handlers.
#[derive(Clone)]
struct Pipeline {
    parser: Arc<Parser>,
    detector: Arc<ProjectDetector>,
    updater: Arc<Updater>,
    sessions: Arc<SessionManager>,
    db: Database,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Route one composer to the new-conversation or update path based on
    /// its watermark.
    async fn process_composer(&self, composer_id: &str) -> Result<(), CaptureError> {
        let processed = self.db.get_processed_count(composer_id).await?;
        let current = self.parser.header_count(composer_id).await? as i64;
        if processed >= current {
            return Ok(());
        }

        if processed == 0 {
            let conv = self.parser.parse_conversation(composer_id).await?;
            if conv.is_empty() {
                return Ok(());
            }
            let total = conv.message_count() as i64;

            let mut project = self.detector.detect(&conv).await;
            if project == UNKNOWN_PROJECT {
                // The cache may predate this conversation's workspace.
                if self.detector.refresh().await.is_ok() {
                    project = self.detector.detect(&conv).await;
                }
            }

            let session_id = self.sessions.get_or_create(&project, conv).await?;
            self.db.mark_processed(composer_id, total).await?;
            debug!(composer_id, session_id = %session_id, project = %project, "new conversation captured");
        } else {
            self.updater.process_update(composer_id).await?;
        }
        Ok(())
    }

    /// Compare every composer against its watermark and capture the ones
    /// that are behind.
    async fn initial_scan(&self) -> Result<(), CaptureError> {
        let ids = self.parser.composer_ids().await?;
        let processed = self.db.get_all_processed_counts().await?;

        let mut pending = Vec::new();
        for id in ids {
            let current = match self.parser.header_count(&id).await {
                Ok(count) => count as i64,
                Err(e) => {
                    warn!(composer_id = %id, error = %e, "cannot read header count, skipping");
                    continue;
                }
            };
            if current > processed.get(&id).copied().unwrap_or(0) {
                pending.push(id);
            }
        }
        info!(pending = pending.len(), "initial reconciliation scan");

        for (i, id) in pending.iter().enumerate() {
            if let Err(e) = self.process_composer(id).await {
                warn!(composer_id = %id, error = %e, "initial scan failed for conversation");
            }
            if (i + 1) % SCAN_PROGRESS_EVERY == 0 {
                info!(done = i + 1, total = pending.len(), "initial scan progress");
            }
        }
        Ok(())
    }

    /// Handle one watcher event: detect growth, process each composer.
    async fn handle_event(&self, event: WatchEvent) {
        debug!(kind = ?event.kind, "handling watcher event");
        let updated = match self.updater.detect_updated().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "update detection failed");
                return;
            }
        };
        for id in updated {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.process_composer(&id).await {
                warn!(composer_id = %id, error = %e, "failed to process conversation");
            }
        }
    }
}

pub struct CaptureOrchestrator {
    pipeline: Pipeline,
    watcher: Arc<DbWatcher>,
    tracker: TaskTracker,
}

impl CaptureOrchestrator {
    /// Wire up the full capture pipeline from a validated config and an
    /// opened database.
    pub fn new(config: &Config, db: Database, cancel: CancellationToken) -> Self {
        let global_db = paths::global_db_path(&config.cursor.log_path);
        let parser = Arc::new(Parser::new(&global_db));
        let detector = Arc::new(ProjectDetector::new(&config.cursor.log_path));
        let watcher = Arc::new(DbWatcher::new(&global_db));
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            config.session.inactivity_timeout(),
        ));
        let updater = Arc::new(Updater::new(
            Arc::clone(&parser),
            db.clone(),
            Arc::clone(&sessions),
        ));

        Self {
            pipeline: Pipeline {
                parser,
                detector,
                updater,
                sessions,
                db,
                cancel,
            },
            watcher,
            tracker: TaskTracker::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.pipeline.sessions
    }

    pub fn parser(&self) -> &Arc<Parser> {
        &self.pipeline.parser
    }

    /// Start capture: load state, start the watcher and the inactivity
    /// monitor, reconcile the store, then react to events.
    pub async fn start(&self) -> Result<(), CaptureError> {
        // Refuse to start when the editor store is absent or unreadable.
        hindsight_core::store::open_read_only(self.pipeline.parser.db_path())?;

        if let Err(e) = self.pipeline.sessions.load().await {
            warn!(error = %e, "could not load persisted sessions, starting empty");
        }
        if let Err(e) = self.pipeline.detector.refresh().await {
            warn!(error = %e, "project cache refresh failed, detection degrades to unknown");
        }

        self.watcher.start()?;

        if let Err(e) = Arc::clone(&self.pipeline.sessions)
            .start_inactivity_monitor(&self.pipeline.cancel)
        {
            self.watcher.stop();
            return Err(e);
        }

        self.pipeline.initial_scan().await?;

        let mut events = self.watcher.events()?;
        let pipeline = self.pipeline.clone();
        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = pipeline.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            let handler = pipeline.clone();
                            tracker.spawn(async move { handler.handle_event(event).await });
                        }
                        None => break,
                    },
                }
            }
            debug!("watcher event loop stopped");
        });

        info!("capture orchestrator started");
        Ok(())
    }

    /// The per-composer pipeline, exposed for reconciliation callers.
    pub async fn process_composer(&self, composer_id: &str) -> Result<(), CaptureError> {
        self.pipeline.process_composer(composer_id).await
    }

    /// Cancel everything, persist sessions, and wait for stragglers.
    pub async fn shutdown(&self) {
        self.pipeline.cancel.cancel();
        self.watcher.stop();
        if let Err(e) = self.pipeline.sessions.stop().await {
            warn!(error = %e, "failed to save sessions during shutdown");
        }

        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("event handlers still running after 10s, abandoning");
        }
        info!("capture orchestrator stopped");
    }
}
