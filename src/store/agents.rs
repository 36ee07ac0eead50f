//! Agent persona queries

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Agent;

/// Parse the collections allow-list; malformed JSON degrades to empty
fn parse_collections(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => {
            warn!("Malformed agent collections JSON: {:?}", raw);
            Vec::new()
        }
    }
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let collections: String = row.get("collections")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        system_prompt: row.get("system_prompt")?,
        collections: parse_collections(&collections),
        temperature: row.get("temperature")?,
        top_k: row.get::<_, i64>("top_k")? as usize,
        icon: row.get("icon")?,
        use_multi_query: row.get::<_, i64>("use_multi_query")? != 0,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Fields accepted when creating or updating an agent
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AgentInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub collections: Option<Vec<String>>,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub icon: Option<String>,
    pub use_multi_query: Option<bool>,
}

pub fn create_agent(conn: &Connection, input: AgentInput) -> Result<Agent> {
    let name = input
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| crate::GroundedError::InvalidInput("Agent name is required".into()))?;
    let system_prompt = input.system_prompt.filter(|p| !p.trim().is_empty()).ok_or_else(|| {
        crate::GroundedError::InvalidInput("Agent system_prompt is required".into())
    })?;

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let collections = input.collections.unwrap_or_default();
    let agent = Agent {
        id: id.clone(),
        name,
        description: input.description.unwrap_or_default(),
        system_prompt,
        collections,
        temperature: input.temperature.unwrap_or(0.7),
        top_k: input.top_k.unwrap_or(15),
        icon: input.icon.unwrap_or_else(|| "G".to_string()),
        use_multi_query: input.use_multi_query.unwrap_or(false),
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO agents (id, name, description, system_prompt, collections, temperature, \
         top_k, icon, use_multi_query, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            agent.id,
            agent.name,
            agent.description,
            agent.system_prompt,
            serde_json::to_string(&agent.collections)?,
            agent.temperature,
            agent.top_k as i64,
            agent.icon,
            agent.use_multi_query as i64,
            now.to_rfc3339(),
        ],
    )?;
    Ok(agent)
}

pub fn get_agent(conn: &Connection, agent_id: &str) -> Result<Option<Agent>> {
    Ok(conn
        .query_row(
            "SELECT * FROM agents WHERE id = ?1",
            params![agent_id],
            agent_from_row,
        )
        .optional()?)
}

pub fn list_agents(conn: &Connection) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare("SELECT * FROM agents ORDER BY created_at ASC")?;
    let rows = stmt.query_map([], agent_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn update_agent(conn: &Connection, agent_id: &str, input: AgentInput) -> Result<Option<Agent>> {
    let Some(mut agent) = get_agent(conn, agent_id)? else {
        return Ok(None);
    };
    if let Some(name) = input.name {
        agent.name = name;
    }
    if let Some(description) = input.description {
        agent.description = description;
    }
    if let Some(system_prompt) = input.system_prompt {
        agent.system_prompt = system_prompt;
    }
    if let Some(collections) = input.collections {
        agent.collections = collections;
    }
    if let Some(temperature) = input.temperature {
        agent.temperature = temperature;
    }
    if let Some(top_k) = input.top_k {
        agent.top_k = top_k;
    }
    if let Some(icon) = input.icon {
        agent.icon = icon;
    }
    if let Some(use_multi_query) = input.use_multi_query {
        agent.use_multi_query = use_multi_query;
    }
    agent.updated_at = Utc::now();

    conn.execute(
        "UPDATE agents SET name = ?1, description = ?2, system_prompt = ?3, collections = ?4, \
         temperature = ?5, top_k = ?6, icon = ?7, use_multi_query = ?8, updated_at = ?9 \
         WHERE id = ?10",
        params![
            agent.name,
            agent.description,
            agent.system_prompt,
            serde_json::to_string(&agent.collections)?,
            agent.temperature,
            agent.top_k as i64,
            agent.icon,
            agent.use_multi_query as i64,
            agent.updated_at.to_rfc3339(),
            agent_id,
        ],
    )?;
    Ok(Some(agent))
}

pub fn delete_agent(conn: &Connection, agent_id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Storage;

    fn input(name: &str) -> AgentInput {
        AgentInput {
            name: Some(name.to_string()),
            system_prompt: Some("You are a coach.".to_string()),
            collections: Some(vec!["kb".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn test_agent_crud() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let agent = create_agent(conn, input("Coach"))?;
                assert_eq!(agent.top_k, 15);
                assert_eq!(agent.collections, vec!["kb"]);

                let updated = update_agent(
                    conn,
                    &agent.id,
                    AgentInput {
                        top_k: Some(8),
                        ..Default::default()
                    },
                )?
                .unwrap();
                assert_eq!(updated.top_k, 8);
                assert_eq!(updated.name, "Coach");

                assert!(delete_agent(conn, &agent.id)?);
                assert!(get_agent(conn, &agent.id)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_malformed_collections_degrade_to_empty() {
        assert!(parse_collections("not json").is_empty());
        assert!(parse_collections("{\"a\": 1}").is_empty());
        assert_eq!(parse_collections("[\"x\"]"), vec!["x"]);
    }

    #[test]
    fn test_missing_name_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let result = create_agent(
                    conn,
                    AgentInput {
                        system_prompt: Some("p".into()),
                        ..Default::default()
                    },
                );
                assert!(result.is_err());
                Ok(())
            })
            .unwrap();
    }
}
