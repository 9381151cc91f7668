// crates/core/src/parser.rs
//! Decodes conversation metadata and message bubbles from the editor's
//! global key-value store.
//!
//! The store layout:
//! - `composerData:{composerId}` → conversation metadata + ordered bubble headers
//! - `bubbleId:{composerId}:{bubbleId}` → one message bubble (JSON)
//!
//! Per-bubble damage (missing row, corrupt JSON, malformed timestamp) is
//! skipped and counted; only a missing/corrupt composer record fails the
//! conversation as a whole.

use crate::error::{ParseError, StoreError};
use crate::store;
use chrono::{DateTime, NaiveDateTime};
use hindsight_types::{
    CodeBlock, ContentSource, Conversation, ConversationStatus, Message, Role, ToolCall,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Key prefix for conversation metadata records.
const COMPOSER_PREFIX: &str = "composerData:";

/// Top-level bubble fields with dedicated columns; everything else is
/// preserved in the message metadata map.
const KNOWN_BUBBLE_FIELDS: &[&str] = &[
    "bubbleId",
    "type",
    "text",
    "createdAt",
    "thinking",
    "codeBlocks",
    "suggestedCodeBlocks",
    "toolFormerData",
    "toolResults",
];

/// Running counters for skip-and-continue decode damage.
#[derive(Debug, Default)]
struct ParseCounters {
    conversations_parsed: AtomicU64,
    missing_bubbles: AtomicU64,
    corrupt_bubbles: AtomicU64,
    invalid_timestamps: AtomicU64,
}

/// Point-in-time snapshot of the parser's damage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseStats {
    pub conversations_parsed: u64,
    pub missing_bubbles: u64,
    pub corrupt_bubbles: u64,
    pub invalid_timestamps: u64,
}

/// One entry of `fullConversationHeadersOnly`.
#[derive(Debug, Clone)]
struct BubbleHeader {
    bubble_id: String,
    bubble_type: i64,
}

/// Reader for the editor's global conversation store.
///
/// Holds no open handle — every operation opens a fresh read-only
/// connection (see [`crate::store`]).
#[derive(Debug)]
pub struct Parser {
    db_path: PathBuf,
    counters: ParseCounters,
}

impl Parser {
    pub fn new(global_db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: global_db_path.into(),
            counters: ParseCounters::default(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// List every composer id present in the store.
    pub async fn composer_ids(&self) -> Result<Vec<String>, StoreError> {
        let keys = store::with_busy_retry(&self.db_path, |conn| {
            store::list_kv_keys(conn, &format!("{COMPOSER_PREFIX}%"))
        })
        .await?;

        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(COMPOSER_PREFIX).map(str::to_string))
            .collect())
    }

    /// Number of bubble headers currently recorded for a conversation,
    /// without fetching any bubble content.
    pub async fn header_count(&self, composer_id: &str) -> Result<usize, ParseError> {
        let raw = self.fetch_composer_data(composer_id).await?;
        let value = parse_composer_json(composer_id, &raw)?;
        Ok(value
            .get("fullConversationHeadersOnly")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0))
    }

    /// Parse one conversation and all of its bubbles.
    pub async fn parse_conversation(&self, composer_id: &str) -> Result<Conversation, ParseError> {
        let raw = self.fetch_composer_data(composer_id).await?;
        let value = parse_composer_json(composer_id, &raw)?;

        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .map(ConversationStatus::parse)
            .unwrap_or_default();
        let created_at = value
            .get("createdAt")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let headers: Vec<BubbleHeader> = value
            .get("fullConversationHeadersOnly")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|h| {
                        Some(BubbleHeader {
                            bubble_id: h.get("bubbleId")?.as_str()?.to_string(),
                            bubble_type: h.get("type").and_then(Value::as_i64).unwrap_or(2),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        // One handle fetches every bubble for this conversation; a BUSY
        // mid-way retries the whole batch.
        let composer = composer_id.to_string();
        let header_ids: Vec<String> = headers.iter().map(|h| h.bubble_id.clone()).collect();
        let raw_bubbles = store::with_busy_retry(&self.db_path, move |conn| {
            let mut out = Vec::with_capacity(header_ids.len());
            for bubble_id in &header_ids {
                let key = format!("bubbleId:{composer}:{bubble_id}");
                out.push(store::get_kv(conn, &key)?);
            }
            Ok(out)
        })
        .await
        .map_err(ParseError::Store)?;

        let mut messages = Vec::with_capacity(headers.len());
        for (header, raw) in headers.iter().zip(raw_bubbles) {
            match raw {
                None => {
                    self.counters.missing_bubbles.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        composer_id,
                        bubble_id = %header.bubble_id,
                        "bubble missing from store, skipping"
                    );
                }
                Some(bytes) => {
                    if let Some(msg) = self.decode_bubble(composer_id, header, &bytes) {
                        messages.push(msg);
                    }
                }
            }
        }

        self.counters
            .conversations_parsed
            .fetch_add(1, Ordering::Relaxed);

        Ok(Conversation {
            composer_id: composer_id.to_string(),
            name,
            status,
            created_at,
            messages,
        })
    }

    /// Parse every conversation in the store, tolerating per-conversation
    /// failures.
    pub async fn parse_all(&self) -> Result<Vec<Conversation>, StoreError> {
        let ids = self.composer_ids().await?;
        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            match self.parse_conversation(&id).await {
                Ok(conv) => conversations.push(conv),
                Err(e) => {
                    warn!(composer_id = %id, error = %e, "skipping unparseable conversation");
                }
            }
        }
        Ok(conversations)
    }

    pub fn stats(&self) -> ParseStats {
        ParseStats {
            conversations_parsed: self.counters.conversations_parsed.load(Ordering::Relaxed),
            missing_bubbles: self.counters.missing_bubbles.load(Ordering::Relaxed),
            corrupt_bubbles: self.counters.corrupt_bubbles.load(Ordering::Relaxed),
            invalid_timestamps: self.counters.invalid_timestamps.load(Ordering::Relaxed),
        }
    }

    async fn fetch_composer_data(&self, composer_id: &str) -> Result<Vec<u8>, ParseError> {
        let key = format!("{COMPOSER_PREFIX}{composer_id}");
        let raw = store::with_busy_retry(&self.db_path, move |conn| {
            store::get_kv(conn, &key)
        })
        .await
        .map_err(ParseError::Store)?;

        raw.ok_or_else(|| ParseError::MissingComposer {
            composer_id: composer_id.to_string(),
        })
    }

    /// Decode one bubble. Corrupt JSON is counted and skipped.
    fn decode_bubble(
        &self,
        composer_id: &str,
        header: &BubbleHeader,
        bytes: &[u8],
    ) -> Option<Message> {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                self.counters.corrupt_bubbles.fetch_add(1, Ordering::Relaxed);
                debug!(
                    composer_id,
                    bubble_id = %header.bubble_id,
                    error = %e,
                    "corrupt bubble JSON, skipping"
                );
                return None;
            }
        };
        let obj = match value.as_object() {
            Some(o) => o,
            None => {
                self.counters.corrupt_bubbles.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let bubble_id = obj
            .get("bubbleId")
            .and_then(Value::as_str)
            .unwrap_or(&header.bubble_id)
            .to_string();
        let msg_type = obj
            .get("type")
            .and_then(Value::as_i64)
            .unwrap_or(header.bubble_type);
        let text = obj
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let thinking_text = obj
            .get("thinking")
            .and_then(|t| t.get("text"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let code_blocks = extract_code_blocks(obj);
        let tool_calls = extract_tool_calls(obj);
        let created_at = self.parse_created_at(composer_id, &bubble_id, obj.get("createdAt"));

        let metadata: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !KNOWN_BUBBLE_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let content_source = ContentSource::derive(
            !text.is_empty(),
            thinking_text.is_some(),
            !code_blocks.is_empty(),
            !tool_calls.is_empty(),
        );

        Some(Message {
            bubble_id,
            msg_type,
            role: Role::from_bubble_type(msg_type),
            text,
            thinking_text,
            code_blocks,
            tool_calls,
            content_source,
            created_at,
            metadata,
        })
    }

    /// Decode a bubble timestamp to Unix milliseconds; 0 on total failure.
    fn parse_created_at(&self, composer_id: &str, bubble_id: &str, value: Option<&Value>) -> i64 {
        match value {
            None => 0,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => match try_parse_timestamp(s) {
                Some(ms) => ms,
                None => {
                    self.counters
                        .invalid_timestamps
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(composer_id, bubble_id, raw = %s, "unparseable bubble timestamp, using zero-time");
                    0
                }
            },
            Some(_) => {
                self.counters
                    .invalid_timestamps
                    .fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }
}

/// Parse an ISO-8601 bubble timestamp to Unix milliseconds.
///
/// RFC 3339 parsing covers fractional seconds down to nanoseconds; the two
/// explicit formats catch naive `...SS.fffZ` / `...SSZ` shapes RFC 3339
/// rejects.
pub fn try_parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

/// Code blocks come from `codeBlocks`, or `suggestedCodeBlocks` when the
/// former is absent. Entries with empty content are dropped.
fn extract_code_blocks(obj: &Map<String, Value>) -> Vec<CodeBlock> {
    let source = obj
        .get("codeBlocks")
        .and_then(Value::as_array)
        .or_else(|| obj.get("suggestedCodeBlocks").and_then(Value::as_array));

    let Some(blocks) = source else {
        return Vec::new();
    };

    blocks
        .iter()
        .enumerate()
        .filter_map(|(idx, block)| {
            let content = block
                .get("content")
                .or_else(|| block.get("code"))
                .and_then(Value::as_str)?;
            if content.is_empty() {
                return None;
            }
            Some(CodeBlock {
                content: content.to_string(),
                language_id: block
                    .get("languageId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                index: block
                    .get("codeBlockIdx")
                    .and_then(Value::as_i64)
                    .unwrap_or(idx as i64),
            })
        })
        .collect()
}

/// Tool calls come from `toolFormerData` (a single record) and
/// `toolResults` (an array). Nameless entries are dropped.
fn extract_tool_calls(obj: &Map<String, Value>) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    if let Some(tool) = obj.get("toolFormerData") {
        if let Some(call) = decode_tool_call(tool, calls.len()) {
            calls.push(call);
        }
    }
    if let Some(results) = obj.get("toolResults").and_then(Value::as_array) {
        for result in results {
            let fallback_idx = calls.len();
            if let Some(call) = decode_tool_call(result, fallback_idx) {
                calls.push(call);
            }
        }
    }

    calls
}

fn decode_tool_call(value: &Value, fallback_idx: usize) -> Option<ToolCall> {
    let name = value.get("name").and_then(Value::as_str)?;
    if name.is_empty() {
        return None;
    }
    Some(ToolCall {
        name: name.to_string(),
        status: value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
        index: value
            .get("toolIndex")
            .and_then(Value::as_i64)
            .unwrap_or(fallback_idx as i64),
    })
}

fn parse_composer_json(composer_id: &str, raw: &[u8]) -> Result<Value, ParseError> {
    serde_json::from_slice(raw).map_err(|e| ParseError::CorruptComposer {
        composer_id: composer_id.to_string(),
        message: e.to_string(),
    })
}
