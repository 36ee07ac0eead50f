//! Shared test fixtures
#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;

use grounded::embedding::Embedder;
use grounded::error::Result;
use grounded::ingest::{ExtractorRegistry, IngestPipeline};
use grounded::vector::{SqliteVectorStore, VectorStore};

pub const DIMS: usize = 32;

/// Deterministic bag-of-words embedder: cosine similarity tracks term
/// overlap, which is enough to drive retrieval assertions offline.
pub struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; DIMS];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() % DIMS as u64) as usize] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        Ok(v)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "stub-bow"
    }

    async fn probe(&self) -> bool {
        true
    }
}

pub fn in_memory_vectors() -> Arc<dyn VectorStore> {
    Arc::new(SqliteVectorStore::open_in_memory().expect("in-memory vector store"))
}

pub fn pipeline(vectors: Arc<dyn VectorStore>) -> IngestPipeline {
    IngestPipeline::new(
        vectors,
        Arc::new(StubEmbedder),
        ExtractorRegistry::new(),
        300,
        60,
    )
}
