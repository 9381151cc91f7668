// crates/db/src/migrations.rs
//! Inline schema migrations, applied in order by `Database::run_migrations`.
//!
//! Never edit an existing entry — append a new one. Versions are 1-based
//! indexes into this slice.

pub const MIGRATIONS: &[&str] = &[
    // v1 — sessions. `conversations_json` predates normalized conversation
    // storage; it is still read at load time for old installs but is always
    // written as NULL.
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        project TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        last_activity INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        conversations_json TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);
    CREATE INDEX IF NOT EXISTS idx_sessions_start_time ON sessions(start_time);
    CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(project) WHERE end_time IS NULL;
    "#,
    // v2 — normalized conversations + messages, and the watermark table that
    // gives updates their at-most-once semantics.
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        composer_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        name TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'none',
        created_at INTEGER NOT NULL DEFAULT 0,
        message_count INTEGER NOT NULL DEFAULT 0,
        first_message_time INTEGER,
        last_message_time INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);
    CREATE INDEX IF NOT EXISTS idx_conversations_created ON conversations(created_at);

    CREATE TABLE IF NOT EXISTS messages (
        bubble_id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(composer_id) ON DELETE CASCADE,
        msg_type INTEGER NOT NULL,
        role TEXT NOT NULL,
        text TEXT NOT NULL DEFAULT '',
        thinking_text TEXT,
        code_blocks TEXT,
        tool_calls TEXT,
        has_code INTEGER NOT NULL DEFAULT 0,
        has_thinking INTEGER NOT NULL DEFAULT 0,
        has_tool_calls INTEGER NOT NULL DEFAULT 0,
        content_source TEXT NOT NULL DEFAULT 'text',
        created_at INTEGER NOT NULL DEFAULT 0,
        metadata TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
    CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
    CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(msg_type);

    CREATE TABLE IF NOT EXISTS processed_conversations (
        composer_id TEXT PRIMARY KEY,
        message_count INTEGER NOT NULL DEFAULT 0,
        last_processed_at INTEGER NOT NULL DEFAULT 0
    );
    "#,
    // v3 — git commits and per-file changes.
    r#"
    CREATE TABLE IF NOT EXISTS commits (
        hash TEXT PRIMARY KEY,
        session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
        repository_path TEXT NOT NULL,
        repository_name TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        author_name TEXT NOT NULL DEFAULT '',
        author_email TEXT NOT NULL DEFAULT '',
        timestamp INTEGER NOT NULL,
        branch TEXT NOT NULL DEFAULT 'unknown',
        is_merge INTEGER NOT NULL DEFAULT 0,
        parent_hashes TEXT NOT NULL DEFAULT '[]',
        full_diff TEXT,
        diff_truncated INTEGER NOT NULL DEFAULT 0,
        diff_total_lines INTEGER,
        diff_shown_lines INTEGER,
        correlation_type TEXT NOT NULL DEFAULT 'none',
        time_delta_seconds INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_commits_session ON commits(session_id);
    CREATE INDEX IF NOT EXISTS idx_commits_timestamp ON commits(timestamp);
    CREATE INDEX IF NOT EXISTS idx_commits_repository ON commits(repository_path);

    CREATE TABLE IF NOT EXISTS commit_files (
        id TEXT PRIMARY KEY,
        commit_hash TEXT NOT NULL REFERENCES commits(hash) ON DELETE CASCADE,
        file_path TEXT NOT NULL,
        lines_added INTEGER NOT NULL DEFAULT 0,
        lines_removed INTEGER NOT NULL DEFAULT 0,
        file_diff TEXT,
        UNIQUE(commit_hash, file_path)
    );
    CREATE INDEX IF NOT EXISTS idx_commit_files_commit ON commit_files(commit_hash);
    CREATE INDEX IF NOT EXISTS idx_commit_files_path ON commit_files(file_path);
    "#,
];
