//! Collection, folder and agent routes

use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::GroundedError;
use crate::store::{agents, folders};
use crate::types::Agent;
use crate::vector::admin;

use super::documents::validate_collection_name;
use super::{ApiResult, AppState};

// --- Collections ---

#[derive(Debug, Deserialize)]
struct CollectionCreate {
    name: String,
}

async fn list_collections(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let collections = admin::get_all_collections(state.vectors.as_ref())?;
    Ok(Json(json!({ "collections": collections })))
}

async fn create_collection(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CollectionCreate>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&body.name)?;
    state.vectors.get_or_create_collection(&body.name)?;
    Ok(Json(json!({
        "name": body.name,
        "document_count": 0,
        "total_chunks": 0,
    })))
}

async fn get_collection(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    if !state.vectors.has_collection(&name)? {
        return Err(GroundedError::NotFound(format!("Collection '{}'", name)).into());
    }
    let info = admin::collection_info(state.vectors.as_ref(), &name)?;
    let documents = admin::get_collection_documents(state.vectors.as_ref(), &name)?;
    Ok(Json(json!({
        "name": info.name,
        "document_count": info.document_count,
        "total_chunks": info.total_chunks,
        "documents": documents,
    })))
}

async fn delete_collection(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;

    // Agents referencing the collection keep working but lose this scope
    let affected: Vec<String> = state
        .storage
        .with_connection(agents::list_agents)?
        .into_iter()
        .filter(|agent| agent.collections.contains(&name))
        .map(|agent| agent.name)
        .collect();

    if !state.vectors.delete_collection(&name)? {
        return Err(GroundedError::NotFound(format!("Collection '{}'", name)).into());
    }

    let mut result = json!({"deleted": true, "name": name});
    if !affected.is_empty() {
        result["affected_agents"] = json!(affected);
        result["warning"] = json!(format!(
            "This collection was used by agent(s): {}",
            affected.join(", ")
        ));
    }
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct ChunksQuery {
    #[serde(default = "default_chunk_limit")]
    limit: usize,
}

fn default_chunk_limit() -> usize {
    500
}

async fn get_document_chunks(
    State(state): State<Arc<AppState>>,
    UrlPath((name, document_id)): UrlPath<(String, String)>,
    Query(query): Query<ChunksQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    let limit = query.limit.clamp(1, 1000);
    let chunks = admin::get_document_chunks(state.vectors.as_ref(), &name, &document_id, limit)?;
    let rendered: Vec<serde_json::Value> = chunks
        .into_iter()
        .map(|(id, content, chunk_index, metadata)| {
            json!({
                "id": id,
                "content": content,
                "chunk_index": chunk_index,
                "metadata": metadata,
            })
        })
        .collect();
    Ok(Json(json!({
        "document_id": document_id,
        "collection": name,
        "total_chunks": rendered.len(),
        "chunks": rendered,
    })))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    UrlPath((name, document_id)): UrlPath<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    state
        .storage
        .with_connection(|conn| folders::unset_document_folder(conn, &document_id))?;
    let removed = admin::delete_document(state.vectors.as_ref(), &name, &document_id)?;
    Ok(Json(json!({
        "deleted": true,
        "document_id": document_id,
        "chunks_removed": removed,
    })))
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    #[serde(default = "default_min_chars")]
    min_chars: usize,
}

fn default_min_chars() -> usize {
    50
}

async fn cleanup_collection(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    let min_chars = query.min_chars.min(10_000);
    let removed = admin::cleanup_micro_chunks(state.vectors.as_ref(), &name, min_chars)?;
    Ok(Json(json!({
        "collection": name,
        "chunks_removed": removed,
        "min_chars": min_chars,
    })))
}

// --- Folders ---

#[derive(Debug, Deserialize)]
struct FolderCreate {
    name: String,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderUpdate {
    name: Option<String>,
    /// Present-and-null moves the folder to the collection root
    #[serde(default, deserialize_with = "deserialize_explicit_option")]
    parent_id: Option<Option<String>>,
}

fn deserialize_explicit_option<'de, D>(
    deserializer: D,
) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::<String>::deserialize(deserializer)?))
}

async fn list_folders(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    let (folders, counts) = state.storage.with_connection(|conn| {
        Ok((
            folders::list_folders(conn, &name)?,
            folders::folder_document_counts(conn)?,
        ))
    })?;
    let rendered: Vec<serde_json::Value> = folders
        .iter()
        .map(|folder| {
            json!({
                "id": folder.id,
                "collection": folder.collection,
                "name": folder.name,
                "parent_id": folder.parent_id,
                "created_at": folder.created_at,
                "document_count": counts.get(&folder.id).copied().unwrap_or(0),
            })
        })
        .collect();
    Ok(Json(json!({ "folders": rendered })))
}

async fn create_folder(
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
    Json(body): Json<FolderCreate>,
) -> ApiResult<Json<crate::types::Folder>> {
    validate_collection_name(&name)?;
    let folder = state.storage.with_connection(|conn| {
        folders::create_folder(conn, &name, &body.name, body.parent_id.as_deref())
    })?;
    Ok(Json(folder))
}

async fn update_folder(
    State(state): State<Arc<AppState>>,
    UrlPath((name, folder_id)): UrlPath<(String, String)>,
    Json(body): Json<FolderUpdate>,
) -> ApiResult<Json<crate::types::Folder>> {
    validate_collection_name(&name)?;
    let folder = state.storage.with_connection(|conn| {
        folders::update_folder(
            conn,
            &folder_id,
            body.name.as_deref(),
            body.parent_id.as_ref().map(|p| p.as_deref()),
        )
    })?;
    Ok(Json(folder))
}

async fn delete_folder(
    State(state): State<Arc<AppState>>,
    UrlPath((name, folder_id)): UrlPath<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    let removed = state
        .storage
        .with_connection(|conn| folders::delete_folder(conn, &folder_id))?;
    Ok(Json(json!({"deleted": true, "folders_removed": removed})))
}

#[derive(Debug, Deserialize)]
struct DocumentFolderUpdate {
    folder_id: Option<String>,
}

async fn set_document_folder(
    State(state): State<Arc<AppState>>,
    UrlPath((name, document_id)): UrlPath<(String, String)>,
    Json(body): Json<DocumentFolderUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_collection_name(&name)?;
    state.storage.with_connection(|conn| match &body.folder_id {
        Some(folder_id) => {
            let folder = folders::get_folder(conn, folder_id)?
                .ok_or_else(|| GroundedError::NotFound(format!("Folder '{}'", folder_id)))?;
            if folder.collection != name {
                return Err(GroundedError::InvalidInput(
                    "Folder belongs to a different collection".into(),
                ));
            }
            folders::set_document_folder(conn, &document_id, folder_id)
        }
        None => folders::unset_document_folder(conn, &document_id),
    })?;
    Ok(Json(json!({"document_id": document_id, "folder_id": body.folder_id})))
}

// --- Agents ---

async fn list_agents_route(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Agent>>> {
    Ok(Json(state.storage.with_connection(agents::list_agents)?))
}

async fn create_agent_route(
    State(state): State<Arc<AppState>>,
    Json(body): Json<agents::AgentInput>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(
        state
            .storage
            .with_connection(|conn| agents::create_agent(conn, body.clone()))?,
    ))
}

async fn get_agent_route(
    State(state): State<Arc<AppState>>,
    UrlPath(agent_id): UrlPath<String>,
) -> ApiResult<Json<Agent>> {
    let agent = state
        .storage
        .with_connection(|conn| agents::get_agent(conn, &agent_id))?
        .ok_or_else(|| GroundedError::NotFound(format!("Agent '{}'", agent_id)))?;
    Ok(Json(agent))
}

async fn update_agent_route(
    State(state): State<Arc<AppState>>,
    UrlPath(agent_id): UrlPath<String>,
    Json(body): Json<agents::AgentInput>,
) -> ApiResult<Json<Agent>> {
    let agent = state
        .storage
        .with_connection(|conn| agents::update_agent(conn, &agent_id, body.clone()))?
        .ok_or_else(|| GroundedError::NotFound(format!("Agent '{}'", agent_id)))?;
    Ok(Json(agent))
}

async fn delete_agent_route(
    State(state): State<Arc<AppState>>,
    UrlPath(agent_id): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state
        .storage
        .with_connection(|conn| agents::delete_agent(conn, &agent_id))?;
    if !deleted {
        return Err(GroundedError::NotFound(format!("Agent '{}'", agent_id)).into());
    }
    Ok(Json(json!({"deleted": true})))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/collections", get(list_collections).post(create_collection))
        .route(
            "/collections/:name",
            get(get_collection).delete(delete_collection),
        )
        .route(
            "/collections/:name/documents/:document_id/chunks",
            get(get_document_chunks),
        )
        .route(
            "/collections/:name/documents/:document_id",
            delete(delete_document),
        )
        .route(
            "/collections/:name/documents/:document_id/folder",
            put(set_document_folder),
        )
        .route("/collections/:name/cleanup", post(cleanup_collection))
        .route(
            "/collections/:name/folders",
            get(list_folders).post(create_folder),
        )
        .route(
            "/collections/:name/folders/:folder_id",
            put(update_folder).delete(delete_folder),
        )
        .route("/agents", get(list_agents_route).post(create_agent_route))
        .route(
            "/agents/:agent_id",
            get(get_agent_route)
                .put(update_agent_route)
                .delete(delete_agent_route),
        )
}
