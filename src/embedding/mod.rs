//! Embedding generation
//!
//! One HTTP embedding backend per deployment with a fixed vector dimension.
//! If the backend is unreachable the client surfaces an unavailable error
//! rather than falling back to a different model: a smaller-dimension
//! fallback would corrupt every existing collection.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, warn};

use crate::config::Settings;
use crate::error::{GroundedError, Result};

/// Max texts per upstream call
pub const EMBED_BATCH_SIZE: usize = 50;

/// Retry attempts per batch
const MAX_RETRIES: u32 = 3;

/// Trait for embedding generators
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed embedding dimension for this deployment
    fn dimensions(&self) -> usize;

    /// Model name
    fn model_name(&self) -> &str;

    /// Cheap connectivity probe
    async fn probe(&self) -> bool;
}

/// HTTP embedding client (Ollama-compatible batch embed endpoint)
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.embedding_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: settings.embedding_api_key.clone(),
            model: settings.embedding_model.clone(),
            dimensions: settings.embedding_dimensions,
        })
    }

    async fn call(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "input": inputs,
            }));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GroundedError::Embedding(format!(
                "Embedding API error {}: {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response.json().await?;
        if parsed.embeddings.len() != inputs.len() {
            return Err(GroundedError::Embedding(format!(
                "Embedding count mismatch: sent {}, got {}",
                inputs.len(),
                parsed.embeddings.len()
            )));
        }
        for embedding in &parsed.embeddings {
            if embedding.len() != self.dimensions {
                // A different model answered. Storing these vectors would mix
                // dimensions within existing collections.
                return Err(GroundedError::EmbeddingUnavailable(format!(
                    "model '{}' returned {}-dimensional vectors, expected {}; refusing to store",
                    self.model,
                    embedding.len(),
                    self.dimensions
                )));
            }
        }
        Ok(parsed.embeddings)
    }

    /// One batch with exponential backoff (1s, 2s, 4s)
    async fn call_with_retries(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            match self.call(inputs).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e @ GroundedError::EmbeddingUnavailable(_)) => return Err(e),
                Err(e) => {
                    if attempt + 1 < MAX_RETRIES {
                        let wait = 1u64 << attempt;
                        warn!(
                            "Embed batch failed (attempt {}/{}): {}. Retrying in {}s...",
                            attempt + 1,
                            MAX_RETRIES,
                            e,
                            wait
                        );
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(
            "Embedding failed after {} attempts: {}. Refusing fallback to avoid dimension drift.",
            MAX_RETRIES, cause
        );
        Err(GroundedError::EmbeddingUnavailable(format!(
            "embedding model '{}' is unreachable ({})",
            self.model, cause
        )))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.call_with_retries(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| GroundedError::Embedding("Empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            all.extend(self.call_with_retries(batch).await?);
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn probe(&self) -> bool {
        self.call(&["test".to_string()]).await.is_ok()
    }
}
