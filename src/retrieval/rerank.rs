//! Cross-encoder reranking
//!
//! Scores (query, passage) pairs jointly through an external rerank
//! endpoint, which is far more precise than bi-encoder similarity alone.
//! Only the top candidates are reranked; any failure keeps the previous
//! order.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{GroundedError, Result};
use crate::types::{char_prefix, RetrievedChunk};

/// How many leading candidates get reranked
pub const MAX_RERANK_CANDIDATES: usize = 30;

/// Passage truncation for the scoring pair
const PASSAGE_CHARS: usize = 512;

/// Raw logit → [0, 1] distance (lower = better), matching the cosine
/// convention of the dense scores. Out-of-band logits clip.
pub fn normalize_logit(logit: f32) -> f32 {
    (1.0 - (logit + 10.0) / 20.0).clamp(0.0, 1.0)
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankEntry>,
}

#[derive(Debug, Deserialize)]
struct RerankEntry {
    index: usize,
    relevance_score: f32,
}

pub struct CrossEncoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl CrossEncoder {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<(usize, f32)>> {
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "query": query,
                "documents": passages,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GroundedError::Search(format!(
                "Rerank endpoint returned {}",
                response.status()
            )));
        }

        let parsed: RerankResponse = response.json().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| (r.index, r.relevance_score))
            .collect())
    }

    /// Rerank the leading candidates by cross-encoder score. The tail keeps
    /// its order behind them; on any failure the input order is preserved.
    pub async fn rerank(
        &self,
        query: &str,
        chunks: Vec<RetrievedChunk>,
    ) -> Vec<RetrievedChunk> {
        if chunks.len() < 2 {
            return chunks;
        }
        let split = chunks.len().min(MAX_RERANK_CANDIDATES);
        let mut candidates = chunks;
        let rest = candidates.split_off(split);

        let passages: Vec<&str> = candidates
            .iter()
            .map(|c| char_prefix(&c.content, PASSAGE_CHARS))
            .collect();

        match self.score(query, &passages).await {
            Ok(scores) => {
                for (index, logit) in scores {
                    if let Some(chunk) = candidates.get_mut(index) {
                        chunk.relevance_score = normalize_logit(logit);
                    }
                }
                candidates.sort_by(|a, b| {
                    a.relevance_score
                        .partial_cmp(&b.relevance_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                info!("Cross-encoder re-ranked {} chunks", candidates.len());
                candidates.extend(rest);
                candidates
            }
            Err(e) => {
                warn!("Cross-encoder re-ranking failed: {}", e);
                candidates.extend(rest);
                candidates
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_logit() {
        // Strong positive logit → near 0 (best)
        assert!(normalize_logit(9.0) < 0.1);
        // Strong negative logit → near 1 (worst)
        assert!(normalize_logit(-9.0) > 0.9);
        // Midpoint
        assert!((normalize_logit(0.0) - 0.5).abs() < 1e-6);
        // Out-of-band logits clip
        assert_eq!(normalize_logit(100.0), 0.0);
        assert_eq!(normalize_logit(-100.0), 1.0);
    }
}
