// crates/git/src/correlate.rs
//! Matches commits to sessions by normalized project name and timestamp
//! proximity.
//!
//! A commit correlates `active` when it lands inside a session's lifetime
//! AND within five minutes of one of that session's messages; `proximate`
//! when only the five-minute proximity holds; `none` otherwise. Active
//! beats proximate, smaller delta beats larger within a tier.

use hindsight_capture::SessionManager;
use hindsight_core::project::normalize_project_name;
use hindsight_db::Database;
use hindsight_types::{Commit, Correlation, CorrelationType, Session};
use std::sync::Arc;
use tracing::debug;

/// Maximum commit-to-message distance for a correlation, in milliseconds.
const CORRELATION_WINDOW_MS: i64 = 5 * 60 * 1000;

struct Candidate {
    session_id: String,
    tier: CorrelationType,
    delta_ms: i64,
}

#[derive(Clone)]
pub struct CorrelationEngine {
    sessions: Arc<SessionManager>,
    db: Database,
}

impl CorrelationEngine {
    pub fn new(sessions: Arc<SessionManager>, db: Database) -> Self {
        Self { sessions, db }
    }

    /// Correlate one commit against all known sessions of its project.
    /// Never errors: any failure degrades to `none`.
    pub async fn correlate(&self, commit: &Commit) -> Correlation {
        let project = normalize_project_name(&commit.repository_name);
        let sessions = self.sessions.sessions_for_project(&project).await;
        if sessions.is_empty() {
            return Correlation::default();
        }

        let mut best: Option<Candidate> = None;
        for session in &sessions {
            let Some(candidate) = self.evaluate(session, commit).await else {
                continue;
            };
            let replace = match &best {
                None => true,
                Some(current) => {
                    (rank(candidate.tier), candidate.delta_ms)
                        < (rank(current.tier), current.delta_ms)
                }
            };
            if replace {
                best = Some(candidate);
            }
        }

        match best {
            Some(c) => {
                debug!(
                    hash = %commit.hash,
                    session_id = %c.session_id,
                    tier = c.tier.as_str(),
                    delta_s = c.delta_ms / 1000,
                    "commit correlated"
                );
                Correlation {
                    session_id: Some(c.session_id),
                    correlation_type: c.tier,
                    time_delta_seconds: Some(c.delta_ms / 1000),
                }
            }
            None => Correlation::default(),
        }
    }

    /// Score one session against a commit, reading message timestamps from
    /// conversation storage. Sessions with no stored conversations are
    /// non-correlatable.
    async fn evaluate(&self, session: &Session, commit: &Commit) -> Option<Candidate> {
        let conversations = self
            .db
            .get_session_conversations(&session.id)
            .await
            .ok()?;
        let delta_ms = conversations
            .iter()
            .flat_map(|c| c.messages.iter())
            .map(|m| (commit.timestamp - m.created_at).abs())
            .min()?;

        if delta_ms > CORRELATION_WINDOW_MS {
            return None;
        }

        let in_window = session.start_time <= commit.timestamp
            && commit.timestamp <= session.end_time.unwrap_or(i64::MAX);

        Some(Candidate {
            session_id: session.id.clone(),
            tier: if in_window {
                CorrelationType::Active
            } else {
                CorrelationType::Proximate
            },
            delta_ms,
        })
    }
}

/// Lower ranks first: active < proximate.
fn rank(tier: CorrelationType) -> u8 {
    match tier {
        CorrelationType::Active => 0,
        CorrelationType::Proximate => 1,
        CorrelationType::None => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hindsight_types::{
        ContentSource, Conversation, ConversationStatus, Message, Role,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const MINUTE_MS: i64 = 60 * 1000;

    fn conv(composer_id: &str, message_times: &[i64]) -> Conversation {
        Conversation {
            composer_id: composer_id.to_string(),
            name: String::new(),
            status: ConversationStatus::Active,
            created_at: message_times.first().copied().unwrap_or(0),
            messages: message_times
                .iter()
                .enumerate()
                .map(|(i, ts)| Message {
                    bubble_id: format!("{composer_id}-b{i}"),
                    msg_type: 1,
                    role: Role::User,
                    text: "hi".to_string(),
                    thinking_text: None,
                    code_blocks: vec![],
                    tool_calls: vec![],
                    content_source: ContentSource::Text,
                    created_at: *ts,
                    metadata: serde_json::Map::new(),
                })
                .collect(),
        }
    }

    fn commit_at(name: &str, ts: i64) -> Commit {
        Commit {
            hash: "a".repeat(40),
            repository_path: format!("/home/u/code/{name}"),
            repository_name: name.to_string(),
            message: "work".to_string(),
            author_name: "Dev".to_string(),
            author_email: "d@e.com".to_string(),
            timestamp: ts,
            branch: "main".to_string(),
            is_merge: false,
            parent_hashes: vec![],
        }
    }

    struct Fixture {
        sessions: Arc<SessionManager>,
        engine: CorrelationEngine,
    }

    async fn fixture() -> Fixture {
        let db = Database::new_in_memory().await.unwrap();
        let sessions = Arc::new(SessionManager::new(db.clone(), Duration::from_secs(1800)));
        let engine = CorrelationEngine::new(Arc::clone(&sessions), db);
        Fixture { sessions, engine }
    }

    #[tokio::test]
    async fn test_active_match_inside_session_window() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let sid = fx
            .sessions
            .get_or_create("proj-a", conv("c1", &[now - MINUTE_MS, now]))
            .await
            .unwrap();

        // 90 seconds after the latest message, session still active
        let correlation = fx
            .engine
            .correlate(&commit_at("proj-a", now + 90 * 1000))
            .await;
        assert_eq!(correlation.session_id, Some(sid));
        assert_eq!(correlation.correlation_type, CorrelationType::Active);
        assert_eq!(correlation.time_delta_seconds, Some(90));
    }

    #[tokio::test]
    async fn test_proximate_match_outside_session_window() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let sid = fx
            .sessions
            .get_or_create("proj-a", conv("c1", &[now]))
            .await
            .unwrap();
        fx.sessions.end_session(&sid).await.unwrap();

        // Two minutes after the session ended: near a message but outside
        // the session's lifetime. (end_time is set to wall-clock now, so a
        // commit in the future falls outside.)
        let commit_ts = now + 10 * MINUTE_MS;
        let session = fx.sessions.get_session(&sid).await.unwrap();
        assert!(commit_ts > session.end_time.unwrap());

        // Message proximity alone cannot reach across 10 minutes
        let correlation = fx.engine.correlate(&commit_at("proj-a", commit_ts)).await;
        assert_eq!(correlation.correlation_type, CorrelationType::None);

        // But 2 minutes out (still past end_time) is proximate
        let commit_ts = session.end_time.unwrap() + 2 * MINUTE_MS;
        let correlation = fx.engine.correlate(&commit_at("proj-a", commit_ts)).await;
        assert_eq!(correlation.correlation_type, CorrelationType::Proximate);
        assert_eq!(correlation.session_id, Some(sid));
    }

    #[tokio::test]
    async fn test_five_minute_boundary() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        fx.sessions
            .get_or_create("proj-a", conv("c1", &[now]))
            .await
            .unwrap();

        // Exactly five minutes away correlates
        let at_limit = fx
            .engine
            .correlate(&commit_at("proj-a", now + 5 * MINUTE_MS))
            .await;
        assert_eq!(at_limit.correlation_type, CorrelationType::Active);
        assert_eq!(at_limit.time_delta_seconds, Some(300));

        // One second past the limit does not
        let past_limit = fx
            .engine
            .correlate(&commit_at("proj-a", now + 5 * MINUTE_MS + 1000))
            .await;
        assert_eq!(past_limit.correlation_type, CorrelationType::None);
        assert_eq!(past_limit.session_id, None);
    }

    #[tokio::test]
    async fn test_project_name_normalization_links_repo_to_session() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        let sid = fx
            .sessions
            .get_or_create("my-project", conv("c1", &[now]))
            .await
            .unwrap();

        // Repo basename "My Project" normalizes to "my-project"
        let correlation = fx.engine.correlate(&commit_at("My Project", now)).await;
        assert_eq!(correlation.session_id, Some(sid));
    }

    #[tokio::test]
    async fn test_unrelated_project_is_none() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        fx.sessions
            .get_or_create("proj-a", conv("c1", &[now]))
            .await
            .unwrap();

        let correlation = fx.engine.correlate(&commit_at("proj-z", now)).await;
        assert_eq!(correlation, Correlation::default());
    }

    #[tokio::test]
    async fn test_conversationless_session_is_skipped() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();
        // A session whose conversation has no messages offers no
        // timestamps to correlate against
        fx.sessions
            .get_or_create("proj-a", conv("c1", &[]))
            .await
            .unwrap();

        let correlation = fx.engine.correlate(&commit_at("proj-a", now)).await;
        assert_eq!(correlation.correlation_type, CorrelationType::None);
    }

    #[tokio::test]
    async fn test_smaller_delta_wins_within_tier() {
        let fx = fixture().await;
        let now = chrono::Utc::now().timestamp_millis();

        // Two sessions for the same project: roll the first over by making
        // it stale, then create a second
        let s1 = fx
            .sessions
            .get_or_create("proj-a", conv("c1", &[now - 4 * MINUTE_MS]))
            .await
            .unwrap();
        fx.sessions.end_session(&s1).await.unwrap();
        let s2 = fx
            .sessions
            .get_or_create("proj-a", conv("c2", &[now - MINUTE_MS]))
            .await
            .unwrap();

        // Commit now: both sessions within 5 minutes of a message, but s2's
        // message is closer and s2 is still active
        let correlation = fx.engine.correlate(&commit_at("proj-a", now)).await;
        assert_eq!(correlation.session_id, Some(s2.clone()));
        assert_eq!(correlation.correlation_type, CorrelationType::Active);
        let _ = s2;
    }
}
