//! Provider usage accounting
//!
//! One append-only row per provider call. Cost estimation uses a static
//! pay-as-you-go pricing table; free-tier models are pinned to zero.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde_json::json;

use crate::error::Result;
use crate::types::CallType;

/// (model, input $/token, output $/token)
const PRICING: &[(&str, f64, f64)] = &[
    ("llama-3.3-70b-versatile", 0.59e-6, 0.79e-6),
    ("llama-3.1-8b-instant", 0.05e-6, 0.08e-6),
];

/// $/second of transcribed audio, roughly $0.04/hour
const WHISPER_PER_SECOND: f64 = 0.04 / 3600.0;

const FREE_MODELS: &[&str] = &[
    "llama-3.3-70b",
    "meta-llama/llama-3.3-70b-instruct:free",
];

const DEFAULT_PRICING: (f64, f64) = (0.50e-6, 0.70e-6);

fn chat_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    if FREE_MODELS.contains(&model) {
        return 0.0;
    }
    let (input, output) = PRICING
        .iter()
        .find(|(m, _, _)| *m == model)
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PRICING);
    input_tokens as f64 * input + output_tokens as f64 * output
}

/// Append a chat-call usage row
pub fn log_chat_usage(
    conn: &Connection,
    provider: &str,
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
) -> Result<()> {
    let total = if total_tokens > 0 {
        total_tokens
    } else {
        input_tokens + output_tokens
    };
    conn.execute(
        "INSERT INTO provider_usage (timestamp, provider, call_type, model, input_tokens, \
         output_tokens, total_tokens, estimated_cost) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Utc::now().to_rfc3339(),
            provider,
            CallType::Chat.as_str(),
            model,
            input_tokens,
            output_tokens,
            total,
            chat_cost(model, input_tokens, output_tokens),
        ],
    )?;
    Ok(())
}

/// Append a transcription usage row
pub fn log_whisper_usage(
    conn: &Connection,
    provider: &str,
    model: &str,
    audio_seconds: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO provider_usage (timestamp, provider, call_type, model, audio_seconds, \
         estimated_cost) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Utc::now().to_rfc3339(),
            provider,
            CallType::Whisper.as_str(),
            model,
            audio_seconds,
            audio_seconds * WHISPER_PER_SECOND,
        ],
    )?;
    Ok(())
}

fn rollup(conn: &Connection, where_clause: &str) -> Result<serde_json::Value> {
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), \
         COALESCE(SUM(total_tokens), 0), COALESCE(SUM(audio_seconds), 0), \
         COALESCE(SUM(estimated_cost), 0) FROM provider_usage {}",
        where_clause
    );
    let value = conn.query_row(&sql, [], |row: &Row<'_>| {
        Ok(json!({
            "requests": row.get::<_, i64>(0)?,
            "input_tokens": row.get::<_, i64>(1)?,
            "output_tokens": row.get::<_, i64>(2)?,
            "total_tokens": row.get::<_, i64>(3)?,
            "audio_seconds": (row.get::<_, f64>(4)? * 10.0).round() / 10.0,
            "estimated_cost": (row.get::<_, f64>(5)? * 10_000.0).round() / 10_000.0,
        }))
    })?;
    Ok(value)
}

/// Usage rollups: today, this month, all time, daily series, by-model
pub fn get_usage_stats(conn: &Connection) -> Result<serde_json::Value> {
    let today = rollup(conn, "WHERE DATE(timestamp) = DATE('now')")?;
    let this_month = rollup(
        conn,
        "WHERE strftime('%Y-%m', timestamp) = strftime('%Y-%m', 'now')",
    )?;
    let all_time = rollup(conn, "")?;

    let mut stmt = conn.prepare(
        "SELECT DATE(timestamp) AS day, COUNT(*), COALESCE(SUM(total_tokens), 0), \
         COALESCE(SUM(audio_seconds), 0), COALESCE(SUM(estimated_cost), 0) \
         FROM provider_usage WHERE timestamp >= DATE('now', '-30 days') \
         GROUP BY DATE(timestamp) ORDER BY day ASC",
    )?;
    let daily: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            Ok(json!({
                "day": row.get::<_, String>(0)?,
                "requests": row.get::<_, i64>(1)?,
                "tokens": row.get::<_, i64>(2)?,
                "audio_seconds": (row.get::<_, f64>(3)? * 10.0).round() / 10.0,
                "cost": (row.get::<_, f64>(4)? * 10_000.0).round() / 10_000.0,
            }))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT model, provider, call_type, COUNT(*), COALESCE(SUM(total_tokens), 0), \
         COALESCE(SUM(audio_seconds), 0), COALESCE(SUM(estimated_cost), 0) \
         FROM provider_usage GROUP BY model, provider, call_type ORDER BY COUNT(*) DESC",
    )?;
    let by_model: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            Ok(json!({
                "model": row.get::<_, String>(0)?,
                "provider": row.get::<_, String>(1)?,
                "type": row.get::<_, String>(2)?,
                "requests": row.get::<_, i64>(3)?,
                "tokens": row.get::<_, i64>(4)?,
                "audio_seconds": (row.get::<_, f64>(5)? * 10.0).round() / 10.0,
                "cost": (row.get::<_, f64>(6)? * 10_000.0).round() / 10_000.0,
            }))
        })?
        .collect::<rusqlite::Result<_>>()?;

    Ok(json!({
        "today": today,
        "this_month": this_month,
        "all_time": all_time,
        "daily_usage": daily,
        "by_model": by_model,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Storage;

    #[test]
    fn test_chat_cost() {
        assert_eq!(chat_cost("llama-3.3-70b", 1000, 1000), 0.0);
        let cost = chat_cost("llama-3.3-70b-versatile", 1_000_000, 0);
        assert!((cost - 0.59).abs() < 1e-9);
        // Unknown models fall back to default pricing
        let cost = chat_cost("mystery-model", 1_000_000, 1_000_000);
        assert!((cost - 1.20).abs() < 1e-9);
    }

    #[test]
    fn test_usage_rollup() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                log_chat_usage(conn, "groq", "llama-3.3-70b-versatile", 100, 50, 0)?;
                log_whisper_usage(conn, "groq", "whisper-large-v3-turbo", 30.0)?;
                let stats = get_usage_stats(conn)?;
                assert_eq!(stats["all_time"]["requests"], 2);
                assert_eq!(stats["all_time"]["total_tokens"], 150);
                assert_eq!(stats["all_time"]["audio_seconds"], 30.0);
                assert_eq!(stats["by_model"].as_array().unwrap().len(), 2);
                Ok(())
            })
            .unwrap();
    }
}
