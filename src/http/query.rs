//! One-shot query routes (no session, no memory)

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::chat::prompts::build_rag_prompt;
use crate::error::GroundedError;
use crate::retrieval::{RetrieveOptions, SearchScope};
use crate::types::SourceRef;

use super::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
    collection: Option<String>,
    top_k: Option<usize>,
    #[serde(default = "default_include_sources")]
    include_sources: bool,
    #[serde(default = "default_temperature")]
    temperature: f32,
}

fn default_include_sources() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

const NO_RESULTS_ANSWER: &str = "I could not find relevant information in the documents. \
Check whether documents were uploaded to the right collection.";

impl QueryRequest {
    fn validate(&self, max_top_k: usize) -> Result<(), GroundedError> {
        if self.question.trim().is_empty() {
            return Err(GroundedError::InvalidInput("Question cannot be empty".into()));
        }
        if let Some(top_k) = self.top_k {
            if top_k == 0 || top_k > max_top_k {
                return Err(GroundedError::InvalidInput(format!(
                    "top_k must be between 1 and {}",
                    max_top_k
                )));
            }
        }
        Ok(())
    }

    fn scope(&self) -> SearchScope {
        match &self.collection {
            Some(name) => SearchScope::Collection(name.clone()),
            None => SearchScope::All,
        }
    }
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    body.validate(state.settings.max_top_k)?;
    let chunks = state
        .retriever
        .retrieve(
            body.question.trim(),
            &body.scope(),
            &RetrieveOptions {
                top_k: body.top_k,
                ..Default::default()
            },
        )
        .await?;

    if chunks.is_empty() {
        return Ok(Json(json!({
            "answer": NO_RESULTS_ANSWER,
            "sources": [],
            "model_used": state.llm.active_provider_label(),
        })));
    }

    let (system_prompt, user_prompt) = build_rag_prompt(body.question.trim(), &chunks);
    let answer = state
        .llm
        .generate(&user_prompt, Some(&system_prompt), body.temperature)
        .await?;

    let sources: Vec<SourceRef> = if body.include_sources {
        chunks.iter().map(SourceRef::from_chunk).collect()
    } else {
        Vec::new()
    };

    Ok(Json(json!({
        "answer": answer,
        "sources": sources,
        "model_used": state.llm.active_provider_label(),
    })))
}

async fn query_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    body.validate(state.settings.max_top_k)?;
    let chunks = state
        .retriever
        .retrieve(
            body.question.trim(),
            &body.scope(),
            &RetrieveOptions {
                top_k: body.top_k,
                ..Default::default()
            },
        )
        .await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
    let question = body.question.trim().to_string();
    let temperature = body.temperature;
    tokio::spawn(async move {
        if chunks.is_empty() {
            let _ = tx
                .send(Event::default().data(NO_RESULTS_ANSWER.to_string()))
                .await;
            let _ = tx.send(Event::default().data("[DONE]")).await;
            return;
        }
        let (system_prompt, user_prompt) = build_rag_prompt(&question, &chunks);
        match state
            .llm
            .generate_stream(&user_prompt, Some(&system_prompt), temperature)
            .await
        {
            Ok(mut generation) => {
                while let Some(item) = generation.tokens.recv().await {
                    match item {
                        Ok(token) => {
                            if tx.send(Event::default().data(token)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(
                                    Event::default()
                                        .event("error")
                                        .data(json!({"detail": e.public_message()}).to_string()),
                                )
                                .await;
                            return;
                        }
                    }
                }
                let _ = tx.send(Event::default().data("[DONE]")).await;
            }
            Err(e) => {
                let _ = tx
                    .send(
                        Event::default()
                            .event("error")
                            .data(json!({"detail": e.public_message()}).to_string()),
                    )
                    .await;
            }
        }
    });

    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<Event, Infallible>> + Send>,
    > = Box::pin(ReceiverStream::new(rx).map(Ok));
    Ok((
        [
            ("Cache-Control", "no-cache"),
            ("X-Accel-Buffering", "no"),
        ],
        Sse::new(stream),
    ))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/query", post(query))
        .route("/query/stream", post(query_stream))
}
