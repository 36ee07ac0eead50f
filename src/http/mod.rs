//! HTTP surface
//!
//! All API routes live under /api/v1. Middleware order (outermost first):
//! security headers, CORS, auth + rate limiting, tracing.

mod chat_routes;
mod collections;
mod documents;
pub mod middleware;
mod query;

pub use middleware::RateLimiter;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chat::ChatOrchestrator;
use crate::config::Settings;
use crate::embedding::Embedder;
use crate::error::GroundedError;
use crate::ingest::{IngestPipeline, WebFetcher};
use crate::jobs::JobStore;
use crate::llm::LlmRouter;
use crate::retrieval::Retriever;
use crate::store::Storage;
use crate::vector::VectorStore;

/// Process-wide services, composed once at startup
pub struct AppState {
    pub settings: Settings,
    pub storage: Storage,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<LlmRouter>,
    pub retriever: Arc<Retriever>,
    pub orchestrator: ChatOrchestrator,
    pub pipeline: Arc<IngestPipeline>,
    pub fetcher: WebFetcher,
    pub jobs: Arc<JobStore>,
    pub rate_limiter: RateLimiter,
}

/// API error envelope: taxonomy status + public message, full detail logged
pub struct ApiError(pub GroundedError);

impl From<GroundedError> for ApiError {
    fn from(e: GroundedError) -> Self {
        ApiError(e)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError(GroundedError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(json!({"detail": self.0.public_message()}))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers = state.llm.health();
    let llm_ok = state.llm.has_providers();
    let vectors_ok = state.vectors.list_collections().is_ok();
    let storage_ok = state
        .storage
        .with_connection(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .is_ok();

    Json(json!({
        "status": if llm_ok && vectors_ok && storage_ok { "ok" } else { "degraded" },
        "version": crate::VERSION,
        "providers": providers,
        "active_provider": state.llm.active_provider_label(),
        "embedding_model": state.embedder.model_name(),
        "embedding_dimensions": state.embedder.dimensions(),
        "vector_store": vectors_ok,
        "metadata_store": storage_ok,
        "jobs_in_flight": state.jobs.len(),
    }))
}

async fn verify_token(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    if !state.settings.auth_enabled || state.settings.auth_token.is_empty() {
        return Json(json!({"authenticated": true, "auth_required": false})).into_response();
    }
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match header.strip_prefix("Bearer ") {
        Some(token) if middleware::constant_time_eq(token, &state.settings.auth_token) => {
            Json(json!({"authenticated": true})).into_response()
        }
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid token"})),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Token required"})),
        )
            .into_response(),
    }
}

async fn robots_txt() -> ([(axum::http::HeaderName, &'static str); 1], &'static str) {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nDisallow: /\n",
    )
}

async fn usage_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state
        .storage
        .with_connection(crate::store::usage::get_usage_stats)?;
    Ok(Json(stats))
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .allow_credentials(true)
}

/// Assemble the full application router
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body = state.settings.max_upload_bytes() as usize + 1024 * 1024;

    let api = Router::new()
        .route("/health", get(health))
        .route("/auth/verify", post(verify_token))
        .route("/usage", get(usage_stats))
        .merge(documents::routes())
        .merge(collections::routes())
        .merge(chat_routes::routes())
        .merge(query::routes());

    Router::new()
        .nest("/api/v1", api)
        .route("/robots.txt", get(robots_txt))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(cors_layer(&state.settings))
        .layer(axum::middleware::from_fn(
            middleware::security_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}
