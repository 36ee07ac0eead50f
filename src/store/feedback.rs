//! Message feedback and chat analytics

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::error::Result;
use crate::types::FeedbackKind;

/// Record feedback for a message (upsert: one row per message)
pub fn add_feedback(conn: &Connection, message_id: &str, feedback: FeedbackKind) -> Result<()> {
    let session_id: Option<String> = conn
        .query_row(
            "SELECT session_id FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get(0),
        )
        .optional()?;

    conn.execute(
        "DELETE FROM feedback WHERE message_id = ?1",
        params![message_id],
    )?;
    conn.execute(
        "INSERT INTO feedback (id, message_id, session_id, feedback, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            message_id,
            session_id,
            feedback.as_str(),
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn get_feedback(conn: &Connection, message_id: &str) -> Result<Option<FeedbackKind>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT feedback FROM feedback WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

/// Dashboard aggregates: totals, feedback stats, daily volume, top questions,
/// agent usage, recent feedback
pub fn get_analytics(conn: &Connection) -> Result<serde_json::Value> {
    let count = |sql: &str| -> Result<i64> {
        Ok(conn.query_row(sql, [], |row| row.get(0))?)
    };
    let total_sessions = count("SELECT COUNT(*) FROM sessions")?;
    let total_messages = count("SELECT COUNT(*) FROM messages")?;
    let total_questions = count("SELECT COUNT(*) FROM messages WHERE role = 'user'")?;
    let total_agents = count("SELECT COUNT(*) FROM agents")?;
    let positive = count("SELECT COUNT(*) FROM feedback WHERE feedback = 'positive'")?;
    let negative = count("SELECT COUNT(*) FROM feedback WHERE feedback = 'negative'")?;

    let mut stmt = conn.prepare(
        "SELECT DATE(created_at) AS day, COUNT(*) AS count FROM messages \
         WHERE created_at >= DATE('now', '-30 days') \
         GROUP BY DATE(created_at) ORDER BY day ASC",
    )?;
    let messages_per_day: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            Ok(json!({
                "day": row.get::<_, String>(0)?,
                "count": row.get::<_, i64>(1)?,
            }))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT content, COUNT(*) AS count FROM messages WHERE role = 'user' \
         GROUP BY content ORDER BY count DESC LIMIT 10",
    )?;
    let top_questions: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            let content: String = row.get(0)?;
            Ok(json!({
                "question": crate::types::char_prefix(&content, 100),
                "count": row.get::<_, i64>(1)?,
            }))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT a.name, a.icon, COUNT(s.id) AS session_count FROM agents a \
         LEFT JOIN sessions s ON s.agent_id = a.id \
         GROUP BY a.id ORDER BY session_count DESC",
    )?;
    let agent_usage: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            Ok(json!({
                "name": row.get::<_, String>(0)?,
                "icon": row.get::<_, String>(1)?,
                "sessions": row.get::<_, i64>(2)?,
            }))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT f.feedback, f.created_at, m.content, s.title FROM feedback f \
         JOIN messages m ON m.id = f.message_id \
         LEFT JOIN sessions s ON s.id = f.session_id \
         ORDER BY f.created_at DESC LIMIT 20",
    )?;
    let recent_feedback: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            let content: String = row.get(2)?;
            let preview = if content.chars().count() > 120 {
                format!("{}...", crate::types::char_prefix(&content, 120))
            } else {
                content
            };
            Ok(json!({
                "feedback": row.get::<_, String>(0)?,
                "created_at": row.get::<_, String>(1)?,
                "message_preview": preview,
                "session_title": row.get::<_, Option<String>>(3)?,
            }))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let total_feedback = positive + negative;
    Ok(json!({
        "totals": {
            "sessions": total_sessions,
            "messages": total_messages,
            "questions": total_questions,
            "agents": total_agents,
        },
        "feedback": {
            "positive": positive,
            "negative": negative,
            "total": total_feedback,
            "satisfaction_rate": if total_feedback > 0 {
                Some((positive as f64 / total_feedback as f64 * 1000.0).round() / 10.0)
            } else {
                None
            },
        },
        "messages_per_day": messages_per_day,
        "top_questions": top_questions,
        "agent_usage": agent_usage,
        "recent_feedback": recent_feedback,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{sessions, Storage};
    use crate::types::Role;

    #[test]
    fn test_feedback_upsert() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let session = sessions::create_session(conn, None, None)?;
                let msg = sessions::add_message(conn, &session.id, Role::Assistant, "hi", &[])?;

                add_feedback(conn, &msg.id, FeedbackKind::Positive)?;
                add_feedback(conn, &msg.id, FeedbackKind::Negative)?;
                assert_eq!(get_feedback(conn, &msg.id)?, Some(FeedbackKind::Negative));

                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM feedback WHERE message_id = ?1",
                    params![msg.id],
                    |row| row.get(0),
                )?;
                assert_eq!(n, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_analytics_shape() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let session = sessions::create_session(conn, None, None)?;
                sessions::add_message(conn, &session.id, Role::User, "q", &[])?;
                let analytics = get_analytics(conn)?;
                assert_eq!(analytics["totals"]["sessions"], 1);
                assert_eq!(analytics["totals"]["questions"], 1);
                assert!(analytics["feedback"]["satisfaction_rate"].is_null());
                Ok(())
            })
            .unwrap();
    }
}
