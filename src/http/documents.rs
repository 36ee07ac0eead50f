//! Document ingestion routes
//!
//! Uploads validate and persist synchronously, then a detached worker runs
//! the pipeline and records the outcome in the job store for polling. URL
//! ingestion is synchronous.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::error::GroundedError;
use crate::types::{IngestReport, IngestStatus};

use super::{ApiError, ApiResult, AppState};

pub const MAX_BATCH_FILES: usize = 20;

static COLLECTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").expect("valid regex"));

pub fn validate_collection_name(name: &str) -> Result<(), GroundedError> {
    if COLLECTION_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(GroundedError::InvalidInput(
            "Invalid collection name. Use only letters, numbers, dashes and underscores \
             (1-64 chars, must start with alphanumeric)."
                .into(),
        ))
    }
}

/// Strip directory components and leading dots so uploads cannot traverse
/// out of the staging directory
pub fn sanitize_filename(raw: &str) -> String {
    let name = Path::new(raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.trim_start_matches('.').to_string();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

struct UploadedFile {
    filename: String,
    bytes: Vec<u8>,
}

/// Pull files and the target collection out of a multipart body
async fn read_multipart(
    multipart: &mut Multipart,
    max_bytes: u64,
) -> Result<(Vec<UploadedFile>, String), GroundedError> {
    let mut files = Vec::new();
    let mut collection = "default".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GroundedError::InvalidInput(format!("Malformed multipart body: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "collection" => {
                collection = field
                    .text()
                    .await
                    .map_err(|e| GroundedError::InvalidInput(e.to_string()))?;
            }
            "file" | "files" => {
                let filename = sanitize_filename(field.file_name().unwrap_or("unknown"));
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| GroundedError::InvalidInput(format!("Upload read failed: {}", e)))?
                    .to_vec();
                if bytes.len() as u64 > max_bytes {
                    return Err(GroundedError::InvalidInput(format!(
                        "File too large: {:.1}MB (max {}MB)",
                        bytes.len() as f64 / 1024.0 / 1024.0,
                        max_bytes / 1024 / 1024
                    )));
                }
                files.push(UploadedFile { filename, bytes });
            }
            _ => {}
        }
    }
    Ok((files, collection))
}

/// Save the payload, start a background job, report `processing`
async fn start_background_ingestion(
    state: &Arc<AppState>,
    file: UploadedFile,
    collection: &str,
) -> IngestReport {
    let staging_path: PathBuf = state.settings.upload_dir.join(&file.filename);
    if let Err(e) = std::fs::create_dir_all(&state.settings.upload_dir) {
        return IngestReport::error(&file.filename, collection, format!("Failed to save file: {}", e));
    }

    if !state.pipeline.registry().supports(&staging_path) {
        return IngestReport::error(
            &file.filename,
            collection,
            format!(
                "No extractor for this file type. Supported: {}",
                state.pipeline.registry().supported_extensions().join(", ")
            ),
        );
    }

    if let Err(e) = std::fs::write(&staging_path, &file.bytes) {
        return IngestReport::error(&file.filename, collection, format!("Failed to save file: {}", e));
    }

    let job_id = state.jobs.create(&file.filename, collection);
    info!(
        "Started background ingestion job {} for {}",
        job_id, file.filename
    );

    let state_bg = state.clone();
    let collection_bg = collection.to_string();
    let filename = file.filename.clone();
    let job_id_bg = job_id.clone();
    tokio::spawn(async move {
        let result = state_bg
            .pipeline
            .ingest_file(&staging_path, &collection_bg)
            .await;
        match result {
            Ok(report) => {
                info!(
                    "Background job {} completed: {} chunks",
                    job_id_bg, report.chunks_created
                );
                state_bg
                    .jobs
                    .complete(&job_id_bg, report.status, Some(report), None);
            }
            Err(e) => {
                error!("Background job {} failed: {}", job_id_bg, e);
                state_bg
                    .jobs
                    .complete(&job_id_bg, IngestStatus::Error, None, Some(e.public_message()));
            }
        }
        // Staging files are removed once the pipeline is done with them
        let _ = std::fs::remove_file(&staging_path);
    });

    IngestReport {
        document_id: String::new(),
        filename,
        file_type: String::new(),
        chunks_created: 0,
        collection: collection.to_string(),
        content_hash: String::new(),
        status: IngestStatus::Processing,
        error: None,
        job_id: Some(job_id),
    }
}

fn check_content_length(headers: &HeaderMap, max_bytes: u64) -> Result<(), GroundedError> {
    if let Some(length) = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        // Allow multipart framing overhead on top of the file cap
        if length > max_bytes + 1024 * 1024 {
            return Err(GroundedError::InvalidInput(format!(
                "Upload too large: {:.1}MB (max {}MB)",
                length as f64 / 1024.0 / 1024.0,
                max_bytes / 1024 / 1024
            )));
        }
    }
    Ok(())
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<IngestReport>> {
    check_content_length(&headers, state.settings.max_upload_bytes())?;
    let (mut files, collection) =
        read_multipart(&mut multipart, state.settings.max_upload_bytes()).await?;
    validate_collection_name(&collection)?;
    let file = files
        .pop()
        .ok_or_else(|| GroundedError::InvalidInput("No file in upload".into()))?;

    Ok(Json(start_background_ingestion(&state, file, &collection).await))
}

async fn upload_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    check_content_length(&headers, state.settings.max_upload_bytes())?;
    let (files, collection) =
        read_multipart(&mut multipart, state.settings.max_upload_bytes()).await?;
    validate_collection_name(&collection)?;
    if files.is_empty() {
        return Err(GroundedError::InvalidInput("No files in upload".into()).into());
    }
    if files.len() > MAX_BATCH_FILES {
        return Err(GroundedError::InvalidInput(format!(
            "Too many files (max {} per batch)",
            MAX_BATCH_FILES
        ))
        .into());
    }

    // Per-file failures never abort sibling files
    let mut documents = Vec::with_capacity(files.len());
    for file in files {
        documents.push(start_background_ingestion(&state, file, &collection).await);
    }
    let total_chunks: usize = documents.iter().map(|d| d.chunks_created).sum();
    Ok(Json(json!({
        "documents": documents,
        "total_chunks": total_chunks,
    })))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> ApiResult<Json<crate::types::Job>> {
    let job = state
        .jobs
        .get(&job_id)
        .ok_or_else(|| GroundedError::NotFound(format!("Job '{}'", job_id)))?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct UrlUploadRequest {
    url: String,
    #[serde(default = "default_collection")]
    collection: String,
}

fn default_collection() -> String {
    "default".to_string()
}

async fn upload_url(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UrlUploadRequest>,
) -> ApiResult<Json<IngestReport>> {
    validate_collection_name(&body.collection)?;
    match state
        .pipeline
        .ingest_url(&state.fetcher, &body.url, &body.collection)
        .await
    {
        Ok(report) => Ok(Json(report)),
        // SSRF refusals stay loud; other failures become an error report so
        // clients get a uniform shape
        Err(e @ GroundedError::BlockedUrl(_)) => Err(ApiError(e)),
        Err(e) => {
            error!("URL ingestion failed for {}: {}", body.url, e);
            let truncated: String = body.url.chars().take(100).collect();
            Ok(Json(IngestReport::error(
                &truncated,
                &body.collection,
                e.public_message(),
            )))
        }
    }
}

async fn supported_types(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "extensions": state.pipeline.registry().supported_extensions(),
    }))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/documents/upload", post(upload_document))
        .route("/documents/upload-batch", post(upload_batch))
        .route("/documents/upload-url", post(upload_url))
        .route("/documents/jobs/:job_id", get(get_job))
        .route("/documents/supported-types", get(supported_types))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("plan.pdf"), "plan.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("..."), "unknown");
        assert_eq!(sanitize_filename("dir/sub/file.txt"), "file.txt");
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(validate_collection_name("kb").is_ok());
        assert!(validate_collection_name("my-kb_2").is_ok());
        assert!(validate_collection_name("-leading").is_err());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("has space").is_err());
        assert!(validate_collection_name(&"x".repeat(65)).is_err());
    }
}
