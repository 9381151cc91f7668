// crates/capture/src/session.rs
//! Groups conversations into project-scoped sessions with an inactivity
//! timeout.
//!
//! In-memory state is two maps behind one `RwLock`: all known sessions by
//! id, and the single active session id per project. The inactivity
//! monitor takes the write lock, ends expired sessions, releases the lock,
//! and only then persists.

use crate::{now_ms, CaptureError};
use hindsight_db::Database;
use hindsight_types::{Conversation, Session};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the inactivity monitor sweeps for expired sessions.
const MONITOR_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct SessionState {
    sessions: HashMap<String, Session>,
    active_by_project: HashMap<String, String>,
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Project-scoped session registry with persistence.
pub struct SessionManager {
    db: Database,
    timeout: Duration,
    state: RwLock<SessionState>,
    monitor: std::sync::Mutex<Option<Monitor>>,
}

/// `<unix-seconds>-<16 hex chars>` session identifier.
fn generate_session_id(now: i64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now / 1000, &suffix[..16])
}

/// The activity timestamp a conversation contributes to its session: its
/// latest message time, falling back to its creation time.
fn activity_ts(conv: &Conversation) -> i64 {
    conv.last_message_time().unwrap_or(conv.created_at)
}

/// Insert or replace a conversation within a session's list.
fn upsert_conversation(session: &mut Session, conv: Conversation) {
    match session
        .conversations
        .iter_mut()
        .find(|c| c.composer_id == conv.composer_id)
    {
        Some(existing) => *existing = conv,
        None => session.conversations.push(conv),
    }
}

impl SessionManager {
    pub fn new(db: Database, inactivity_timeout: Duration) -> Self {
        Self {
            db,
            timeout: inactivity_timeout,
            state: RwLock::new(SessionState::default()),
            monitor: std::sync::Mutex::new(None),
        }
    }

    fn timeout_ms(&self) -> i64 {
        self.timeout.as_millis() as i64
    }

    /// Assign `conv` to the project's active session, rolling the session
    /// over when the active one has outlived the inactivity timeout.
    ///
    /// Returns the owning session id. The session row is persisted before
    /// the conversation so the conversation's foreign key resolves.
    pub async fn get_or_create(
        &self,
        project: &str,
        conv: Conversation,
    ) -> Result<String, CaptureError> {
        let now = now_ms();
        let mut state = self.state.write().await;

        if let Some(active_id) = state.active_by_project.get(project).cloned() {
            let expired = state
                .sessions
                .get(&active_id)
                .map(|s| now - s.last_activity >= self.timeout_ms())
                .unwrap_or(true);

            if !expired {
                let session = state
                    .sessions
                    .get_mut(&active_id)
                    .expect("active map points at known session");
                session.last_activity = session.last_activity.max(activity_ts(&conv));
                session.updated_at = now;
                upsert_conversation(session, conv.clone());
                let snapshot = session.clone();
                drop(state);

                self.db.upsert_session(&snapshot).await?;
                self.db.store_conversation(&conv, &active_id).await?;
                return Ok(active_id);
            }

            // Timed out: close it and fall through to a fresh session.
            let ended = state.sessions.get_mut(&active_id).map(|session| {
                session.end_time = Some(now);
                session.updated_at = now;
                session.clone()
            });
            state.active_by_project.remove(project);
            if let Some(ended) = ended {
                self.db.upsert_session(&ended).await?;
                info!(session_id = %active_id, project, "session expired, rolled over");
            }
        }

        let id = generate_session_id(now);
        let session = Session {
            id: id.clone(),
            project: project.to_string(),
            start_time: now,
            end_time: None,
            last_activity: activity_ts(&conv),
            created_at: now,
            updated_at: now,
            conversations: vec![conv.clone()],
        };
        state.sessions.insert(id.clone(), session.clone());
        state
            .active_by_project
            .insert(project.to_string(), id.clone());
        drop(state);

        self.db.upsert_session(&session).await?;
        self.db.store_conversation(&conv, &id).await?;
        debug!(session_id = %id, project, "session created");
        Ok(id)
    }

    /// Append a conversation to a specific, still-active session.
    pub async fn add_conversation(
        &self,
        session_id: &str,
        conv: Conversation,
    ) -> Result<(), CaptureError> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CaptureError::SessionNotFound(session_id.to_string()))?;
        if !session.is_active() {
            return Err(CaptureError::SessionEnded(session_id.to_string()));
        }

        session.last_activity = session.last_activity.max(activity_ts(&conv));
        session.updated_at = now_ms();
        upsert_conversation(session, conv.clone());
        let snapshot = session.clone();
        drop(state);

        self.db.upsert_session(&snapshot).await?;
        self.db.store_conversation(&conv, session_id).await?;
        Ok(())
    }

    /// Advance a session's `last_activity` if `ts` is newer. Used by the
    /// incremental update path.
    pub async fn touch_session(&self, session_id: &str, ts: i64) -> Result<(), CaptureError> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Ok(());
        };
        if ts <= session.last_activity {
            return Ok(());
        }
        session.last_activity = ts;
        session.updated_at = now_ms();
        let snapshot = session.clone();
        drop(state);

        self.db.upsert_session(&snapshot).await?;
        Ok(())
    }

    /// End a session. A second call, or a call for an unknown id, is a
    /// no-op.
    pub async fn end_session(&self, session_id: &str) -> Result<(), CaptureError> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            debug!(session_id, "end_session for unknown id, ignoring");
            return Ok(());
        };
        if !session.is_active() {
            return Ok(());
        }
        let now = now_ms();
        session.end_time = Some(now);
        session.updated_at = now;
        let project = session.project.clone();
        let snapshot = session.clone();
        state.active_by_project.remove(&project);
        drop(state);

        self.db.upsert_session(&snapshot).await?;
        info!(session_id, project = %snapshot.project, "session ended");
        Ok(())
    }

    /// Rebuild in-memory state from persisted sessions.
    ///
    /// Conversations reload from normalized storage; a session whose
    /// normalized storage is empty but which still carries a legacy
    /// `conversations_json` blob has that blob migrated in.
    pub async fn load(&self) -> Result<(), CaptureError> {
        let rows = self.db.load_sessions().await?;
        let mut state = self.state.write().await;
        state.sessions.clear();
        state.active_by_project.clear();

        for (mut session, legacy_json) in rows {
            let mut conversations = self.db.get_session_conversations(&session.id).await?;

            if conversations.is_empty() {
                if let Some(blob) = legacy_json {
                    match serde_json::from_str::<Vec<Conversation>>(&blob) {
                        Ok(legacy_convs) => {
                            for conv in &legacy_convs {
                                self.db.store_conversation(conv, &session.id).await?;
                            }
                            info!(
                                session_id = %session.id,
                                count = legacy_convs.len(),
                                "migrated legacy conversation blob into normalized storage"
                            );
                            conversations = legacy_convs;
                        }
                        Err(e) => {
                            warn!(session_id = %session.id, error = %e, "unreadable legacy conversation blob, ignoring");
                        }
                    }
                }
            }
            session.conversations = conversations;

            if session.is_active() {
                // At most one active session per project; close the older
                // one if a previous run left two behind.
                if let Some(existing_id) =
                    state.active_by_project.insert(session.project.clone(), session.id.clone())
                {
                    let keep_existing = state
                        .sessions
                        .get(&existing_id)
                        .is_some_and(|s| s.last_activity > session.last_activity);
                    let (demote, keep) = if keep_existing {
                        state
                            .active_by_project
                            .insert(session.project.clone(), existing_id.clone());
                        (session.id.clone(), existing_id)
                    } else {
                        (existing_id, session.id.clone())
                    };
                    warn!(ended = %demote, kept = %keep, "two active sessions for one project, ending the stale one");
                    if demote == session.id {
                        session.end_time = Some(now_ms());
                    } else if let Some(older) = state.sessions.get_mut(&demote) {
                        older.end_time = Some(now_ms());
                    }
                }
            }
            state.sessions.insert(session.id.clone(), session);
        }

        info!(
            sessions = state.sessions.len(),
            active = state.active_by_project.len(),
            "session state loaded"
        );
        Ok(())
    }

    /// Persist every known session in one transaction.
    pub async fn save(&self) -> Result<(), CaptureError> {
        let sessions: Vec<Session> = {
            let state = self.state.read().await;
            state.sessions.values().cloned().collect()
        };
        self.db.upsert_sessions(&sessions).await?;
        debug!(count = sessions.len(), "sessions saved");
        Ok(())
    }

    /// Start the periodic inactivity sweep. Errors if already running.
    pub fn start_inactivity_monitor(
        self: std::sync::Arc<Self>,
        parent: &CancellationToken,
    ) -> Result<(), CaptureError> {
        let mut slot = self.monitor.lock().expect("monitor lock poisoned");
        if slot.is_some() {
            return Err(CaptureError::MonitorAlreadyRunning);
        }

        let cancel = parent.child_token();
        let task_cancel = cancel.clone();
        let manager = std::sync::Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITOR_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of `interval` fires immediately; consume it so
            // the first sweep happens one full period in.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tick.tick() => manager.sweep_expired().await,
                }
            }
            debug!("inactivity monitor stopped");
        });

        *slot = Some(Monitor { cancel, handle });
        Ok(())
    }

    /// One monitor sweep: end every active session past the timeout.
    /// Mutation happens under the write lock; persistence after release.
    async fn sweep_expired(&self) {
        let now = now_ms();
        let ended: Vec<Session> = {
            let mut state = self.state.write().await;
            let expired: Vec<(String, String)> = state
                .active_by_project
                .iter()
                .filter_map(|(project, id)| {
                    let session = state.sessions.get(id)?;
                    (now - session.last_activity >= self.timeout_ms())
                        .then(|| (project.clone(), id.clone()))
                })
                .collect();

            let mut ended = Vec::with_capacity(expired.len());
            for (project, id) in expired {
                state.active_by_project.remove(&project);
                if let Some(session) = state.sessions.get_mut(&id) {
                    session.end_time = Some(now);
                    session.updated_at = now;
                    ended.push(session.clone());
                }
            }
            ended
        };

        if ended.is_empty() {
            return;
        }
        for session in &ended {
            info!(session_id = %session.id, project = %session.project, "session timed out");
        }
        if let Err(e) = self.db.upsert_sessions(&ended).await {
            warn!(error = %e, "failed to persist timed-out sessions");
        }
    }

    /// Cancel the monitor (if running) and persist all sessions.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        let monitor = self.monitor.lock().expect("monitor lock poisoned").take();
        if let Some(Monitor { cancel, handle }) = monitor {
            cancel.cancel();
            let _ = handle.await;
        }
        self.save().await
    }

    /// Snapshot of one session.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.state.read().await.sessions.get(session_id).cloned()
    }

    /// All sessions (active and ended) for a normalized project name.
    pub async fn sessions_for_project(&self, project: &str) -> Vec<Session> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.project == project)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_time);
        sessions
    }

    /// The active session id for a project, if one exists.
    pub async fn active_session_id(&self, project: &str) -> Option<String> {
        self.state
            .read()
            .await
            .active_by_project
            .get(project)
            .cloned()
    }
}
