//! Vector store adapter
//!
//! A persistent collection of (id, text, embedding, metadata) records with
//! cosine-distance nearest-neighbor queries and metadata-filtered scans.
//! Distances are cosine: lower = more similar. Collections are
//! dimension-homogeneous; mixing dimensions within one collection is
//! rejected at write time.

pub mod admin;
mod sqlite;

pub use sqlite::SqliteVectorStore;

use crate::error::Result;
use crate::types::{Metadata, Scalar};

/// Deletes are issued in batches of at most this many ids per call.
pub const DELETE_BATCH_SIZE: usize = 500;

/// A stored chunk record
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// A record returned from a nearest-neighbor query
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Cosine distance, lower = more similar
    pub distance: f32,
}

/// Equality filter over metadata fields (conjunctive)
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub conditions: Vec<(String, Scalar)>,
}

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self {
            conditions: vec![(key.into(), value.into())],
        }
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// The store interface consumed by ingestion and retrieval
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist
    fn get_or_create_collection(&self, name: &str) -> Result<()>;

    /// All collection names
    fn list_collections(&self) -> Result<Vec<String>>;

    /// True if the collection exists
    fn has_collection(&self, name: &str) -> Result<bool>;

    /// Insert records. All embeddings must share the collection's dimension.
    fn add(&self, collection: &str, records: Vec<ChunkRecord>) -> Result<()>;

    /// Nearest neighbors by cosine distance, ascending
    fn query(&self, collection: &str, embedding: &[f32], n_results: usize)
        -> Result<Vec<ScoredChunk>>;

    /// Metadata-filtered scan
    fn get(
        &self,
        collection: &str,
        filter: &MetadataFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ChunkRecord>>;

    /// Number of chunks in the collection
    fn count(&self, collection: &str) -> Result<usize>;

    /// Delete chunks by id (internally batched). Returns chunks removed.
    fn delete(&self, collection: &str, ids: &[String]) -> Result<usize>;

    /// Drop the collection and everything in it. Returns false if absent.
    fn delete_collection(&self, name: &str) -> Result<bool>;
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Cosine distance (lower = more similar)
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_distance(&a, &d) - 2.0).abs() < 0.001);
    }

    #[test]
    fn test_filter_matches() {
        let mut meta = Metadata::new();
        meta.insert("document_id".into(), Scalar::Str("d1".into()));
        meta.insert("chunk_index".into(), Scalar::Int(2));

        assert!(MetadataFilter::eq("document_id", "d1").matches(&meta));
        assert!(MetadataFilter::eq("document_id", "d1")
            .and("chunk_index", 2i64)
            .matches(&meta));
        assert!(!MetadataFilter::eq("document_id", "d2").matches(&meta));
        assert!(!MetadataFilter::eq("missing", "x").matches(&meta));
    }
}
