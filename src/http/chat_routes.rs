//! Chat session routes and SSE streaming

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::chat::{attachment_collection_name, ChatEvent};
use crate::error::GroundedError;
use crate::store::{feedback, sessions};
use crate::types::{FeedbackKind, IngestReport, IngestStatus};

use super::documents::sanitize_filename;
use super::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
struct NewSessionRequest {
    collection: Option<String>,
    agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    top_k: Option<usize>,
    #[serde(default = "default_temperature")]
    temperature: f32,
}

fn default_temperature() -> f32 {
    0.3
}

impl ChatRequest {
    fn validate(&self, max_top_k: usize) -> Result<(), GroundedError> {
        if self.message.trim().is_empty() {
            return Err(GroundedError::InvalidInput("Message cannot be empty".into()));
        }
        if self.message.chars().count() > 10_000 {
            return Err(GroundedError::InvalidInput(
                "Message too long (max 10000 characters)".into(),
            ));
        }
        if let Some(top_k) = self.top_k {
            if top_k == 0 || top_k > max_top_k {
                return Err(GroundedError::InvalidInput(format!(
                    "top_k must be between 1 and {}",
                    max_top_k
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GroundedError::InvalidInput(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: i64,
    #[serde(default)]
    q: String,
}

fn default_list_limit() -> i64 {
    50
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<NewSessionRequest>>,
) -> ApiResult<Json<crate::types::Session>> {
    let (collection, agent_id) = body
        .map(|Json(b)| (b.collection, b.agent_id))
        .unwrap_or((None, None));
    if let Some(collection) = &collection {
        super::documents::validate_collection_name(collection)?;
    }
    let session = state
        .orchestrator
        .start_session(collection.as_deref(), agent_id.as_deref())?;
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.clamp(1, 500);
    let sessions = state
        .storage
        .with_connection(|conn| sessions::list_sessions(conn, limit))?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn search_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.clamp(1, 500);
    let needle = query.q.trim().to_string();
    let sessions = state.storage.with_connection(|conn| {
        if needle.is_empty() {
            sessions::list_sessions(conn, limit)
        } else {
            sessions::search_sessions(conn, &needle, limit)
        }
    })?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let (session, messages) = state.storage.with_connection(|conn| {
        let session = sessions::get_session(conn, &session_id)?
            .ok_or_else(|| GroundedError::NotFound(format!("Session '{}'", session_id)))?;
        let messages = sessions::get_messages(conn, &session_id, 500)?;
        Ok((session, messages))
    })?;
    Ok(Json(json!({"session": session, "messages": messages})))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.storage.with_connection(|conn| {
        sessions::get_session(conn, &session_id)?
            .ok_or_else(|| GroundedError::NotFound(format!("Session '{}'", session_id)))?;
        Ok(())
    })?;

    // The session's attachment collection goes with it
    let attachment = attachment_collection_name(&session_id);
    match state.vectors.delete_collection(&attachment) {
        Ok(true) => info!("Cleaned up attachment collection for session {}", session_id),
        Ok(false) => {}
        Err(e) => debug!("No attachment collection to clean: {}", e),
    }

    state
        .storage
        .with_connection(|conn| sessions::delete_session(conn, &session_id))?;
    Ok(Json(json!({"deleted": true})))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<Json<crate::chat::ChatResponse>> {
    body.validate(state.settings.max_top_k)?;
    let response = state
        .orchestrator
        .chat(
            &session_id,
            body.message.trim(),
            body.top_k,
            body.temperature,
        )
        .await?;
    Ok(Json(response))
}

fn to_sse_event(event: ChatEvent) -> Event {
    match event {
        ChatEvent::Status(status) => Event::default()
            .event("status")
            .data(json!(status).to_string()),
        ChatEvent::Sources(sources) => Event::default()
            .event("sources")
            .data(json!(sources).to_string()),
        ChatEvent::Content(content) => Event::default()
            .event("content")
            .data(json!(content).to_string()),
        ChatEvent::Done(done) => Event::default().event("done").data(json!(done).to_string()),
        ChatEvent::Error { detail } => Event::default()
            .event("error")
            .data(json!({"detail": detail}).to_string()),
    }
}

async fn send_message_stream(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    body.validate(state.settings.max_top_k)?;
    let receiver = state
        .orchestrator
        .chat_stream(
            &session_id,
            body.message.trim(),
            body.top_k,
            body.temperature,
        )
        .await?;

    let stream: ReceiverStream<ChatEvent> = ReceiverStream::new(receiver);
    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<Event, Infallible>> + Send>,
    > = Box::pin(stream.map(|event| Ok(to_sse_event(event))));

    let sse = Sse::new(stream);
    Ok((
        [
            ("Cache-Control", "no-cache"),
            ("X-Accel-Buffering", "no"),
        ],
        sse,
    ))
}

/// Upload a file into the session's private attachment collection
async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<IngestReport>> {
    state.storage.with_connection(|conn| {
        sessions::get_session(conn, &session_id)?
            .ok_or_else(|| GroundedError::NotFound(format!("Session '{}'", session_id)))?;
        Ok(())
    })?;

    let mut uploaded: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GroundedError::InvalidInput(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = sanitize_filename(field.file_name().unwrap_or("unknown"));
            let bytes = field
                .bytes()
                .await
                .map_err(|e| GroundedError::InvalidInput(format!("Upload read failed: {}", e)))?
                .to_vec();
            uploaded = Some((filename, bytes));
        }
    }
    let (filename, bytes) = uploaded
        .ok_or_else(|| GroundedError::InvalidInput("No file in upload".into()))?;
    if bytes.len() as u64 > state.settings.max_upload_bytes() {
        return Err(GroundedError::InvalidInput("File too large".into()).into());
    }

    let collection = attachment_collection_name(&session_id);
    std::fs::create_dir_all(&state.settings.upload_dir)?;
    let staging_path = state.settings.upload_dir.join(&filename);
    std::fs::write(&staging_path, &bytes)?;

    // Attachments ingest synchronously so the user can ask about them on the
    // very next turn
    let result = state.pipeline.ingest_file(&staging_path, &collection).await;
    let _ = std::fs::remove_file(&staging_path);
    let report = result?;

    if matches!(report.status, IngestStatus::Success | IngestStatus::Duplicate) {
        state.storage.with_connection(|conn| {
            sessions::update_session_metadata(
                conn,
                &session_id,
                json!({"attachment_collection": collection}),
            )
        })?;
    }
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    message_id: String,
    feedback: String,
}

async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FeedbackRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind: FeedbackKind = body
        .feedback
        .parse()
        .map_err(GroundedError::InvalidInput)?;
    state
        .storage
        .with_connection(|conn| feedback::add_feedback(conn, &body.message_id, kind))?;
    Ok(Json(json!({"recorded": true})))
}

async fn analytics(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.storage.with_connection(feedback::get_analytics)?))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/sessions", post(create_session).get(list_sessions))
        .route("/chat/sessions/search", get(search_sessions))
        .route(
            "/chat/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/chat/sessions/:session_id/messages", post(send_message))
        .route(
            "/chat/sessions/:session_id/messages/stream",
            post(send_message_stream),
        )
        .route(
            "/chat/sessions/:session_id/attachments",
            post(upload_attachment),
        )
        .route("/chat/feedback", post(submit_feedback))
        .route("/chat/analytics", get(analytics))
}
