// crates/types/src/lib.rs
//! Shared entity types for the hindsight capture pipeline.
//!
//! These are the records that flow between the editor-store parser, the
//! session manager, the git poller, and the storage layer. Pure data — no
//! I/O in this crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Lifecycle status reported by the editor for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
    #[default]
    None,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Completed => "completed",
            ConversationStatus::None => "none",
        }
    }

    /// Parse the editor's status string; anything unrecognized maps to `None`.
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => ConversationStatus::Active,
            "completed" => ConversationStatus::Completed,
            _ => ConversationStatus::None,
        }
    }
}

/// Message role, derived from the editor's numeric bubble type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Bubble type 1 is the user; everything else is the agent.
    pub fn from_bubble_type(bubble_type: i64) -> Self {
        if bubble_type == 1 {
            Role::User
        } else {
            Role::Assistant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Which part of a bubble carried its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentSource {
    #[default]
    Text,
    Thinking,
    Code,
    Tool,
    Mixed,
}

impl ContentSource {
    /// Derive the source from which content kinds are present.
    ///
    /// Exactly one kind → that kind; more than one → `Mixed`; none → `Text`.
    pub fn derive(has_text: bool, has_thinking: bool, has_code: bool, has_tool: bool) -> Self {
        let count = [has_text, has_thinking, has_code, has_tool]
            .iter()
            .filter(|b| **b)
            .count();
        match count {
            0 => ContentSource::Text,
            1 if has_text => ContentSource::Text,
            1 if has_thinking => ContentSource::Thinking,
            1 if has_code => ContentSource::Code,
            1 => ContentSource::Tool,
            _ => ContentSource::Mixed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentSource::Text => "text",
            ContentSource::Thinking => "thinking",
            ContentSource::Code => "code",
            ContentSource::Tool => "tool",
            ContentSource::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "thinking" => ContentSource::Thinking,
            "code" => ContentSource::Code,
            "tool" => ContentSource::Tool,
            "mixed" => ContentSource::Mixed,
            _ => ContentSource::Text,
        }
    }
}

/// A code block attached to an agent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeBlock {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_id: Option<String>,
    pub index: i64,
}

/// A tool invocation recorded on an agent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub index: i64,
}

/// One message (bubble) within a conversation.
///
/// `created_at` is Unix milliseconds; a value of 0 means the editor's
/// timestamp could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub bubble_id: String,
    /// Raw editor bubble type: 1 = user, 2 = agent.
    pub msg_type: i64,
    pub role: Role,
    pub text: String,
    pub thinking_text: Option<String>,
    pub code_blocks: Vec<CodeBlock>,
    pub tool_calls: Vec<ToolCall>,
    pub content_source: ContentSource,
    pub created_at: i64,
    /// Unrecognized top-level bubble fields, preserved for forward compat.
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn has_code(&self) -> bool {
        !self.code_blocks.is_empty()
    }

    pub fn has_thinking(&self) -> bool {
        self.thinking_text.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A conversation thread as parsed from the editor store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub composer_id: String,
    pub name: String,
    pub status: ConversationStatus,
    /// Unix milliseconds.
    pub created_at: i64,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Earliest message timestamp, if any message exists.
    pub fn first_message_time(&self) -> Option<i64> {
        self.messages.iter().map(|m| m.created_at).min()
    }

    /// Latest message timestamp, if any message exists.
    pub fn last_message_time(&self) -> Option<i64> {
        self.messages.iter().map(|m| m.created_at).max()
    }
}

/// A project-scoped grouping of conversations, closed by inactivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Normalized project name.
    pub project: String,
    /// Unix milliseconds.
    pub start_time: i64,
    /// `None` means the session is still active.
    pub end_time: Option<i64>,
    pub last_activity: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub conversations: Vec<Conversation>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Watermark row recording how far a conversation has been captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedConversation {
    pub composer_id: String,
    pub message_count: i64,
    /// Unix milliseconds.
    pub last_processed_at: i64,
}

/// A discovered git repository under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub path: PathBuf,
    pub name: String,
    pub git_dir: PathBuf,
    pub is_worktree: bool,
}

/// How a commit was tied to a session, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationType {
    Active,
    Proximate,
    #[default]
    None,
}

impl CorrelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationType::Active => "active",
            CorrelationType::Proximate => "proximate",
            CorrelationType::None => "none",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => CorrelationType::Active,
            "proximate" => CorrelationType::Proximate,
            _ => CorrelationType::None,
        }
    }
}

/// Outcome of matching a commit against known sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Correlation {
    pub session_id: Option<String>,
    pub correlation_type: CorrelationType,
    pub time_delta_seconds: Option<i64>,
}

/// Commit metadata extracted from a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Full SHA-1, immutable once stored.
    pub hash: String,
    pub repository_path: String,
    pub repository_name: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Branch name, `"detached"` off-branch, `"unknown"` on failure.
    pub branch: String,
    pub is_merge: bool,
    pub parent_hashes: Vec<String>,
}

/// Per-file diff stats for one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub additions: i64,
    pub deletions: i64,
    /// Per-file patch text; may be absent past the truncation point.
    pub diff: Option<String>,
}

/// A commit's textual diff with truncation accounting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitDiff {
    pub files: Vec<FileDiff>,
    pub full_diff: String,
    pub truncated: bool,
    pub total_lines: i64,
    pub shown_lines: i64,
}

/// Stored per-file change row for a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFile {
    pub id: String,
    pub commit_hash: String,
    pub file_path: String,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub file_diff: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_bubble_type() {
        assert_eq!(Role::from_bubble_type(1), Role::User);
        assert_eq!(Role::from_bubble_type(2), Role::Assistant);
        // Unknown types are treated as agent output
        assert_eq!(Role::from_bubble_type(7), Role::Assistant);
    }

    #[test]
    fn test_content_source_single_kind() {
        assert_eq!(
            ContentSource::derive(true, false, false, false),
            ContentSource::Text
        );
        assert_eq!(
            ContentSource::derive(false, true, false, false),
            ContentSource::Thinking
        );
        assert_eq!(
            ContentSource::derive(false, false, true, false),
            ContentSource::Code
        );
        assert_eq!(
            ContentSource::derive(false, false, false, true),
            ContentSource::Tool
        );
    }

    #[test]
    fn test_content_source_mixed_and_empty() {
        assert_eq!(
            ContentSource::derive(true, true, false, false),
            ContentSource::Mixed
        );
        assert_eq!(
            ContentSource::derive(true, false, true, true),
            ContentSource::Mixed
        );
        // Nothing present defaults to text
        assert_eq!(
            ContentSource::derive(false, false, false, false),
            ContentSource::Text
        );
    }

    #[test]
    fn test_conversation_derived_times() {
        let msg = |id: &str, ts: i64| Message {
            bubble_id: id.to_string(),
            msg_type: 1,
            role: Role::User,
            text: "hi".to_string(),
            thinking_text: None,
            code_blocks: vec![],
            tool_calls: vec![],
            content_source: ContentSource::Text,
            created_at: ts,
            metadata: Map::new(),
        };
        let conv = Conversation {
            composer_id: "c1".to_string(),
            name: "test".to_string(),
            status: ConversationStatus::Active,
            created_at: 100,
            messages: vec![msg("b1", 300), msg("b2", 100), msg("b3", 200)],
        };
        assert_eq!(conv.message_count(), 3);
        assert_eq!(conv.first_message_time(), Some(100));
        assert_eq!(conv.last_message_time(), Some(300));

        let empty = Conversation {
            messages: vec![],
            ..conv
        };
        assert_eq!(empty.first_message_time(), None);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_status_round_trip() {
        for s in ["active", "completed", "none"] {
            assert_eq!(ConversationStatus::parse(s).as_str(), s);
        }
        assert_eq!(
            ConversationStatus::parse("garbage"),
            ConversationStatus::None
        );
    }

    #[test]
    fn test_session_active_flag() {
        let mut session = Session {
            id: "1700000000-abcd".to_string(),
            project: "proj-a".to_string(),
            start_time: 0,
            end_time: None,
            last_activity: 0,
            created_at: 0,
            updated_at: 0,
            conversations: vec![],
        };
        assert!(session.is_active());
        session.end_time = Some(10);
        assert!(!session.is_active());
    }
}
