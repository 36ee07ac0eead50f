//! Hybrid retrieval
//!
//! Dense vector search fanned out over query variants and target
//! collections, fused with a per-query BM25 pass via Reciprocal Rank
//! Fusion, filtered by a similarity threshold, precision-reranked with a
//! cross-encoder, and finally widened with neighboring chunks from the same
//! documents.
//!
//! Scores flow through as distances: lower = more relevant, matching the
//! vector store's cosine convention.

mod bm25;
mod rerank;

pub use bm25::{tokenize, Bm25Index};
pub use rerank::{normalize_logit, CrossEncoder, MAX_RERANK_CANDIDATES};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::Result;
use crate::llm::LlmRouter;
use crate::types::{char_prefix, MetadataExt, RetrievedChunk};
use crate::vector::{MetadataFilter, VectorStore};

/// Hard cap on documents enumerated for the per-query BM25 index
const BM25_MAX_DOCS: usize = 10_000;

/// RRF constant
const RRF_K: f64 = 60.0;

/// How many leading chunks get neighbor expansion
const MAX_EXPAND: usize = 5;

/// Sibling window for neighbor expansion
const NEIGHBOR_WINDOW: i64 = 1;

const MULTI_QUERY_PROMPT: &str = "You are an AI assistant helping to retrieve relevant documents.\n\
Given the user's question, generate 3 alternative versions of the question that capture\n\
different aspects or phrasings. This helps find more relevant documents.\n\n\
Reply with ONLY the 3 alternative questions, one per line. No numbering, no extra text.\n\n\
Original question: {question}";

/// Which collections a retrieval targets
#[derive(Debug, Clone)]
pub enum SearchScope {
    Collection(String),
    Collections(Vec<String>),
    All,
}

impl SearchScope {
    /// An explicit list, a single name, or all collections when unscoped
    fn resolve(&self, vectors: &dyn VectorStore) -> Result<Vec<String>> {
        match self {
            SearchScope::Collection(name) => Ok(vec![name.clone()]),
            SearchScope::Collections(names) => Ok(names.clone()),
            SearchScope::All => vectors.list_collections(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub top_k: Option<usize>,
    pub use_multi_query: bool,
    pub use_hybrid: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            use_multi_query: false,
            use_hybrid: true,
        }
    }
}

pub struct Retriever {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<LlmRouter>,
    cross_encoder: Option<CrossEncoder>,
    default_top_k: usize,
    max_context_chunks: usize,
    similarity_threshold: f32,
}

impl Retriever {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<LlmRouter>,
        cross_encoder: Option<CrossEncoder>,
        default_top_k: usize,
        max_context_chunks: usize,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            vectors,
            embedder,
            llm,
            cross_encoder,
            default_top_k,
            max_context_chunks,
            similarity_threshold,
        }
    }

    /// Hybrid retrieval over the given scope
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &SearchScope,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedChunk>> {
        let top_k = options.top_k.unwrap_or(self.default_top_k);
        let fetch_k = self.max_context_chunks;
        let targets = scope.resolve(self.vectors.as_ref())?;

        // Query variants: the original plus optional LLM rephrasings
        let mut queries = vec![query.to_string()];
        if options.use_multi_query {
            match self.generate_alternative_queries(query).await {
                Ok(alternatives) => {
                    queries.extend(alternatives);
                    info!("Multi-query: searching with {} queries", queries.len());
                }
                Err(e) => {
                    warn!("Multi-query generation failed, using original only: {}", e)
                }
            }
        }

        // Dense search across every variant and target collection
        let query_embeddings = self.embedder.embed_batch(&queries).await?;
        let mut semantic_results = Vec::new();
        for embedding in &query_embeddings {
            for collection in &targets {
                semantic_results.extend(self.search_collection(collection, embedding, fetch_k));
            }
        }

        let mut semantic_deduped = dedup_by_prefix(semantic_results, 200);
        semantic_deduped.sort_by(|a, b| {
            a.relevance_score
                .partial_cmp(&b.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Sparse pass and rank fusion
        let fused = if options.use_hybrid && !semantic_deduped.is_empty() {
            let bm25_results = self.bm25_search(query, &targets, fetch_k);
            if bm25_results.is_empty() {
                semantic_deduped
            } else {
                let fused =
                    reciprocal_rank_fusion(&semantic_deduped, &bm25_results, RRF_K);
                info!(
                    "Hybrid search: {} semantic + {} BM25 = {} fused results",
                    semantic_deduped.len(),
                    bm25_results.len(),
                    fused.len()
                );
                fused
            }
        } else {
            semantic_deduped
        };

        // Threshold on the (possibly fused) distance; never return empty
        // when candidates exist
        let threshold = self.similarity_threshold;
        let mut relevant: Vec<RetrievedChunk> = fused
            .iter()
            .filter(|c| c.relevance_score <= threshold)
            .cloned()
            .collect();
        if relevant.is_empty() && !fused.is_empty() {
            relevant = fused.into_iter().take(3).collect();
        }

        if relevant.len() > 1 {
            if let Some(cross_encoder) = &self.cross_encoder {
                relevant = cross_encoder.rerank(query, relevant).await;
            }
        }

        relevant.truncate(top_k);

        let result = self.expand_with_neighbors(relevant, &targets);
        info!("Retrieved {} chunks (threshold={})", result.len(), threshold);
        Ok(result)
    }

    async fn generate_alternative_queries(&self, question: &str) -> Result<Vec<String>> {
        let prompt = MULTI_QUERY_PROMPT.replace("{question}", question);
        let response = self.llm.generate(&prompt, None, 0.4).await?;
        Ok(response
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(3)
            .map(String::from)
            .collect())
    }

    /// Dense search in one collection; failures log and return empty
    fn search_collection(
        &self,
        collection: &str,
        embedding: &[f32],
        fetch_k: usize,
    ) -> Vec<RetrievedChunk> {
        let count = match self.vectors.count(collection) {
            Ok(count) => count,
            Err(e) => {
                warn!("Search failed in collection '{}': {}", collection, e);
                return Vec::new();
            }
        };
        if count == 0 {
            return Vec::new();
        }
        match self.vectors.query(collection, embedding, fetch_k.min(count)) {
            Ok(scored) => scored
                .into_iter()
                .map(|record| RetrievedChunk {
                    source_file: record
                        .metadata
                        .source_file()
                        .unwrap_or("unknown")
                        .to_string(),
                    content: record.content,
                    metadata: record.metadata,
                    relevance_score: record.distance,
                })
                .collect(),
            Err(e) => {
                warn!("Search failed in collection '{}': {}", collection, e);
                Vec::new()
            }
        }
    }

    /// Keyword search over all documents in the target collections. Builds a
    /// fresh BM25 index per query; enumeration is capped to bound memory.
    fn bm25_search(
        &self,
        query: &str,
        targets: &[String],
        top_k: usize,
    ) -> Vec<RetrievedChunk> {
        let mut all_chunks: Vec<RetrievedChunk> = Vec::new();

        for collection in targets {
            if all_chunks.len() >= BM25_MAX_DOCS {
                warn!(
                    "BM25: hit {} doc cap, skipping remaining collections",
                    BM25_MAX_DOCS
                );
                break;
            }
            let fetch_limit = BM25_MAX_DOCS - all_chunks.len();
            match self
                .vectors
                .get(collection, &MetadataFilter::default(), Some(fetch_limit))
            {
                Ok(records) => {
                    all_chunks.extend(records.into_iter().map(|record| RetrievedChunk {
                        source_file: record
                            .metadata
                            .source_file()
                            .unwrap_or("unknown")
                            .to_string(),
                        content: record.content,
                        metadata: record.metadata,
                        relevance_score: 1.0,
                    }));
                }
                Err(e) => {
                    warn!("BM25: failed to read collection '{}': {}", collection, e)
                }
            }
        }

        if all_chunks.is_empty() {
            return Vec::new();
        }

        let tokenized: Vec<Vec<String>> =
            all_chunks.iter().map(|c| tokenize(&c.content)).collect();
        let index = Bm25Index::new(&tokenized);
        let scores = index.get_scores(&tokenize(query));

        let mut scored: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut results = Vec::new();
        for (idx, score) in scored.into_iter().take(top_k) {
            if score <= 0.0 {
                continue;
            }
            let mut chunk = all_chunks[idx].clone();
            // Normalize to 0-1, lower = better, matching cosine distance
            chunk.relevance_score = (1.0 - (score / 20.0).min(1.0)).max(0.0) as f32;
            results.push(chunk);
        }
        results
    }

    /// Widen the leading chunks with chunk_index ± window siblings from the
    /// same document, merged in index order. Prefix dedup keeps repeated
    /// overlap text out of adjacent expansions.
    fn expand_with_neighbors(
        &self,
        chunks: Vec<RetrievedChunk>,
        targets: &[String],
    ) -> Vec<RetrievedChunk> {
        if chunks.is_empty() {
            return chunks;
        }
        let mut iter = chunks.into_iter();
        let to_expand: Vec<RetrievedChunk> = iter.by_ref().take(MAX_EXPAND).collect();
        let rest: Vec<RetrievedChunk> = iter.collect();

        // (collection, document_id) -> chunk_index -> content
        let mut neighbor_cache: HashMap<(String, String), HashMap<i64, String>> = HashMap::new();
        for chunk in &to_expand {
            let Some(document_id) = chunk.metadata.document_id() else {
                continue;
            };
            for collection in targets {
                let key = (collection.clone(), document_id.to_string());
                if neighbor_cache.contains_key(&key) {
                    continue;
                }
                let lookup = self.vectors.get(
                    collection,
                    &MetadataFilter::eq("document_id", document_id),
                    None,
                );
                match lookup {
                    Ok(records) => {
                        let by_index: HashMap<i64, String> = records
                            .into_iter()
                            .filter_map(|r| {
                                r.metadata.chunk_index().map(|i| (i, r.content))
                            })
                            .collect();
                        neighbor_cache.insert(key, by_index);
                    }
                    Err(e) => {
                        debug!("Neighbor lookup failed for '{}': {}", collection, e);
                        neighbor_cache.insert(key, HashMap::new());
                    }
                }
            }
        }

        fn seen(prefix: &str, seen_prefixes: &[String]) -> bool {
            seen_prefixes.iter().any(|p| p == prefix)
        }

        let mut expanded = Vec::new();
        let mut seen_prefixes: Vec<String> = Vec::new();

        for chunk in to_expand {
            let doc = chunk.metadata.document_id().map(String::from);
            let index = chunk.metadata.chunk_index();
            let mut parts: Vec<String> = Vec::new();

            if let (Some(document_id), Some(index)) = (&doc, index) {
                for collection in targets {
                    let key = (collection.clone(), document_id.clone());
                    if let Some(cache) = neighbor_cache.get(&key) {
                        for offset in -NEIGHBOR_WINDOW..0 {
                            if let Some(prev) = cache.get(&(index + offset)) {
                                if !seen(char_prefix(prev, 100), &seen_prefixes) {
                                    parts.push(prev.clone());
                                }
                            }
                        }
                    }
                }
            }

            parts.push(chunk.content.clone());

            if let (Some(document_id), Some(index)) = (&doc, index) {
                for collection in targets {
                    let key = (collection.clone(), document_id.clone());
                    if let Some(cache) = neighbor_cache.get(&key) {
                        for offset in 1..=NEIGHBOR_WINDOW {
                            if let Some(next) = cache.get(&(index + offset)) {
                                if !seen(char_prefix(next, 100), &seen_prefixes) {
                                    parts.push(next.clone());
                                }
                            }
                        }
                    }
                }
            }

            let merged = parts.join("\n\n");
            seen_prefixes.push(char_prefix(&merged, 100).to_string());
            expanded.push(RetrievedChunk {
                content: merged,
                metadata: chunk.metadata,
                relevance_score: chunk.relevance_score,
                source_file: chunk.source_file,
            });
        }

        for chunk in rest {
            let prefix = char_prefix(&chunk.content, 100).to_string();
            if !seen(&prefix, &seen_prefixes) {
                seen_prefixes.push(prefix);
                expanded.push(chunk);
            }
        }

        expanded
    }
}

/// Remove duplicates by content prefix, keeping the best (lowest) score
fn dedup_by_prefix(chunks: Vec<RetrievedChunk>, prefix_len: usize) -> Vec<RetrievedChunk> {
    let mut seen: HashMap<String, RetrievedChunk> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for chunk in chunks {
        let key = char_prefix(&chunk.content, prefix_len).to_string();
        match seen.get(&key) {
            Some(existing) if existing.relevance_score <= chunk.relevance_score => {}
            Some(_) => {
                seen.insert(key, chunk);
            }
            None => {
                order.push(key.clone());
                seen.insert(key, chunk);
            }
        }
    }
    order.into_iter().filter_map(|key| seen.remove(&key)).collect()
}

/// Reciprocal Rank Fusion of the dense and sparse rankings.
///
/// Each list contributes `1 / (k + rank + 1)` per chunk; the fused order is
/// descending RRF score. Every fused chunk's relevance_score becomes
/// `min(original, rank/N)` — partly original distance, partly fused rank —
/// and the downstream threshold filter reads exactly this score.
fn reciprocal_rank_fusion(
    semantic: &[RetrievedChunk],
    keyword: &[RetrievedChunk],
    k: f64,
) -> Vec<RetrievedChunk> {
    let mut chunk_map: HashMap<String, RetrievedChunk> = HashMap::new();
    let mut rrf_scores: HashMap<String, f64> = HashMap::new();

    for (rank, chunk) in semantic.iter().enumerate() {
        let key = char_prefix(&chunk.content, 200).to_string();
        *rrf_scores.entry(key.clone()).or_insert(0.0) += 1.0 / (k + rank as f64 + 1.0);
        match chunk_map.get(&key) {
            Some(existing) if existing.relevance_score <= chunk.relevance_score => {}
            _ => {
                chunk_map.insert(key, chunk.clone());
            }
        }
    }

    for (rank, chunk) in keyword.iter().enumerate() {
        let key = char_prefix(&chunk.content, 200).to_string();
        *rrf_scores.entry(key.clone()).or_insert(0.0) += 1.0 / (k + rank as f64 + 1.0);
        chunk_map.entry(key).or_insert_with(|| chunk.clone());
    }

    let mut sorted_keys: Vec<String> = rrf_scores.keys().cloned().collect();
    sorted_keys.sort_by(|a, b| {
        rrf_scores[b]
            .partial_cmp(&rrf_scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total = sorted_keys.len().max(1) as f32;
    let mut results = Vec::with_capacity(sorted_keys.len());
    for (i, key) in sorted_keys.iter().enumerate() {
        if let Some(mut chunk) = chunk_map.remove(key) {
            chunk.relevance_score = chunk.relevance_score.min(i as f32 / total);
            results.push(chunk);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn chunk(content: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            content: content.to_string(),
            metadata: Metadata::new(),
            relevance_score: score,
            source_file: "doc.pdf".to_string(),
        }
    }

    #[test]
    fn test_dedup_keeps_best_score() {
        let shared = "identical leading text ".repeat(20);
        let chunks = vec![
            chunk(&shared, 0.5),
            chunk(&shared, 0.2),
            chunk("something else entirely", 0.9),
        ];
        let deduped = dedup_by_prefix(chunks, 200);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].relevance_score, 0.2);
    }

    #[test]
    fn test_rrf_single_list_preserves_order() {
        let list = vec![
            chunk("first result with enough text to be distinct", 0.1),
            chunk("second result with enough text to be distinct", 0.2),
            chunk("third result with enough text to be distinct", 0.3),
        ];
        let fused = reciprocal_rank_fusion(&list, &[], RRF_K);
        let contents: Vec<&str> = fused.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "first result with enough text to be distinct",
                "second result with enough text to be distinct",
                "third result with enough text to be distinct",
            ]
        );
    }

    #[test]
    fn test_rrf_boosts_chunks_in_both_lists() {
        let semantic = vec![
            chunk("alpha passage about periodization fundamentals", 0.3),
            chunk("beta passage about nutrition timing", 0.35),
        ];
        let keyword = vec![
            chunk("beta passage about nutrition timing", 0.4),
        ];
        let fused = reciprocal_rank_fusion(&semantic, &keyword, RRF_K);
        // beta appears in both rankings, so it fuses ahead of alpha
        assert!(fused[0].content.starts_with("beta"));
    }

    #[test]
    fn test_rrf_score_is_min_of_original_and_rank_fraction() {
        let semantic = vec![
            chunk("only one passage in the whole fused set", 0.8),
        ];
        let fused = reciprocal_rank_fusion(&semantic, &[], RRF_K);
        // rank 0 of 1 → 0.0, which undercuts the original 0.8
        assert_eq!(fused[0].relevance_score, 0.0);
    }
}
