//! Session and message queries

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Message, Role, Session, SourceRef};

fn session_from_row(row: &Row<'_>, message_count: i64) -> rusqlite::Result<Session> {
    let metadata: String = row.get("metadata")?;
    Ok(Session {
        id: row.get("id")?,
        title: row.get("title")?,
        created_at: parse_ts(row.get::<_, String>("created_at")?),
        updated_at: parse_ts(row.get::<_, String>("updated_at")?),
        collection: row.get("collection")?,
        agent_id: row.get("agent_id")?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        message_count,
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn create_session(
    conn: &Connection,
    collection: Option<&str>,
    agent_id: Option<&str>,
) -> Result<Session> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO sessions (id, title, created_at, updated_at, collection, agent_id) \
         VALUES (?1, ?2, ?3, ?3, ?4, ?5)",
        params![id, "New chat", now.to_rfc3339(), collection, agent_id],
    )?;
    Ok(Session {
        id,
        title: "New chat".to_string(),
        created_at: now,
        updated_at: now,
        collection: collection.map(String::from),
        agent_id: agent_id.map(String::from),
        metadata: serde_json::json!({}),
        message_count: 0,
    })
}

pub fn get_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )?;
    let session = conn
        .query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![session_id],
            |row| session_from_row(row, count),
        )
        .optional()?;
    Ok(session)
}

pub fn list_sessions(conn: &Connection, limit: i64) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT s.*, COUNT(m.id) AS message_count FROM sessions s \
         LEFT JOIN messages m ON m.session_id = s.id \
         GROUP BY s.id ORDER BY s.updated_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        let count: i64 = row.get("message_count")?;
        session_from_row(row, count)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Search sessions by title or message content substring
pub fn search_sessions(conn: &Connection, query: &str, limit: i64) -> Result<Vec<Session>> {
    let pattern = format!("%{}%", query);
    let mut stmt = conn.prepare(
        "SELECT DISTINCT s.*, COUNT(m.id) AS message_count \
         FROM sessions s \
         LEFT JOIN messages m ON m.session_id = s.id \
         WHERE s.title LIKE ?1 OR s.id IN ( \
             SELECT DISTINCT session_id FROM messages WHERE content LIKE ?1 \
         ) \
         GROUP BY s.id ORDER BY s.updated_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![pattern, limit], |row| {
        let count: i64 = row.get("message_count")?;
        session_from_row(row, count)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn update_session_title(conn: &Connection, session_id: &str, title: &str) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
        params![title, Utc::now().to_rfc3339(), session_id],
    )?;
    Ok(())
}

pub fn delete_session(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM messages WHERE session_id = ?1",
        params![session_id],
    )?;
    conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
    Ok(())
}

/// Read the session metadata blob as a JSON object
pub fn get_session_metadata(conn: &Connection, session_id: &str) -> Result<serde_json::Value> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT metadata FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({})))
}

/// Merge the given keys into the session metadata blob
pub fn update_session_metadata(
    conn: &Connection,
    session_id: &str,
    updates: serde_json::Value,
) -> Result<()> {
    let mut meta = get_session_metadata(conn, session_id)?;
    if let (Some(obj), Some(new)) = (meta.as_object_mut(), updates.as_object()) {
        for (k, v) in new {
            obj.insert(k.clone(), v.clone());
        }
    }
    conn.execute(
        "UPDATE sessions SET metadata = ?1 WHERE id = ?2",
        params![meta.to_string(), session_id],
    )?;
    Ok(())
}

/// Append a message and bump the parent session's updated_at
pub fn add_message(
    conn: &Connection,
    session_id: &str,
    role: Role,
    content: &str,
    sources: &[SourceRef],
) -> Result<Message> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let sources_json = serde_json::to_string(sources)?;
    conn.execute(
        "INSERT INTO messages (id, session_id, role, content, sources, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            session_id,
            role.as_str(),
            content,
            sources_json,
            now.to_rfc3339()
        ],
    )?;
    conn.execute(
        "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), session_id],
    )?;
    Ok(Message {
        id,
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        sources: sources.to_vec(),
        created_at: now,
    })
}

pub fn get_messages(conn: &Connection, session_id: &str, limit: i64) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![session_id, limit], |row| {
        let role: String = row.get("role")?;
        let sources: String = row.get("sources")?;
        Ok(Message {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: role.parse().unwrap_or(Role::User),
            content: row.get("content")?,
            sources: serde_json::from_str(&sources).unwrap_or_default(),
            created_at: parse_ts(row.get::<_, String>("created_at")?),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent messages in chronological order, for search-query context
pub fn get_recent_messages(
    conn: &Connection,
    session_id: &str,
    max_messages: i64,
) -> Result<Vec<Message>> {
    let mut messages = get_messages(conn, session_id, i64::MAX)?;
    let skip = messages.len().saturating_sub(max_messages as usize);
    Ok(messages.split_off(skip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Storage;

    #[test]
    fn test_session_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let session = create_session(conn, Some("kb"), None)?;
                let loaded = get_session(conn, &session.id)?.unwrap();
                assert_eq!(loaded.collection.as_deref(), Some("kb"));
                assert_eq!(loaded.message_count, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_message_order_and_session_touch() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let session = create_session(conn, None, None)?;
                add_message(conn, &session.id, Role::User, "first", &[])?;
                add_message(conn, &session.id, Role::Assistant, "second", &[])?;
                let messages = get_messages(conn, &session.id, 100)?;
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].content, "first");
                assert_eq!(messages[1].role, Role::Assistant);
                let reloaded = get_session(conn, &session.id)?.unwrap();
                assert!(reloaded.updated_at >= session.updated_at);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_metadata_merge() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let session = create_session(conn, None, None)?;
                update_session_metadata(
                    conn,
                    &session.id,
                    serde_json::json!({"summary": "abc", "summary_at_count": 25}),
                )?;
                update_session_metadata(
                    conn,
                    &session.id,
                    serde_json::json!({"attachment_collection": "chatfiles-12ab34cd"}),
                )?;
                let meta = get_session_metadata(conn, &session.id)?;
                assert_eq!(meta["summary"], "abc");
                assert_eq!(meta["summary_at_count"], 25);
                assert_eq!(meta["attachment_collection"], "chatfiles-12ab34cd");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_search_by_content() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let s1 = create_session(conn, None, None)?;
                let _s2 = create_session(conn, None, None)?;
                add_message(conn, &s1.id, Role::User, "tell me about periodization", &[])?;
                let hits = search_sessions(conn, "periodization", 50)?;
                assert_eq!(hits.len(), 1);
                assert_eq!(hits[0].id, s1.id);
                Ok(())
            })
            .unwrap();
    }
}
