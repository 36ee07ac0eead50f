//! Database schema

use rusqlite::Connection;

use crate::error::Result;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL DEFAULT 'New chat',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            collection TEXT DEFAULT NULL,
            agent_id TEXT DEFAULT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            sources TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            system_prompt TEXT NOT NULL,
            collections TEXT NOT NULL DEFAULT '[]',
            temperature REAL NOT NULL DEFAULT 0.7,
            top_k INTEGER NOT NULL DEFAULT 15,
            icon TEXT NOT NULL DEFAULT 'G',
            use_multi_query INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feedback (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            session_id TEXT,
            feedback TEXT NOT NULL CHECK(feedback IN ('positive', 'negative')),
            created_at TEXT NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_feedback_message ON feedback(message_id);
        CREATE INDEX IF NOT EXISTS idx_feedback_created ON feedback(created_at DESC);

        CREATE TABLE IF NOT EXISTS folders (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            parent_id TEXT DEFAULT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES folders(id)
        );

        CREATE INDEX IF NOT EXISTS idx_folders_collection ON folders(collection);

        CREATE TABLE IF NOT EXISTS document_folders (
            document_id TEXT PRIMARY KEY,
            folder_id TEXT NOT NULL,
            FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS provider_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            provider TEXT NOT NULL DEFAULT '',
            call_type TEXT NOT NULL DEFAULT 'chat',
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            audio_seconds REAL NOT NULL DEFAULT 0,
            estimated_cost REAL NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON provider_usage(timestamp);
        "#,
    )?;
    Ok(())
}
