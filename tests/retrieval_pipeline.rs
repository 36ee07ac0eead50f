//! End-to-end ingestion + retrieval tests against in-memory stores
//!
//! Run with: cargo test --test retrieval_pipeline

mod common;

use std::sync::Arc;

use grounded::config::Settings;
use grounded::llm::LlmRouter;
use grounded::retrieval::{RetrieveOptions, Retriever, SearchScope};
use grounded::types::{IngestStatus, Metadata, MetadataExt, Scalar, TextBlock};
use grounded::vector::VectorStore;

use common::{in_memory_vectors, pipeline, StubEmbedder};

fn retriever(vectors: Arc<dyn VectorStore>) -> Retriever {
    // No provider credentials: multi-query stays off and nothing reaches an LLM
    let router = Arc::new(LlmRouter::from_settings(&Settings::default(), None).unwrap());
    Retriever::new(
        vectors,
        Arc::new(StubEmbedder),
        router,
        None,
        15,
        30,
        0.65,
    )
}

fn block(text: &str) -> TextBlock {
    let mut metadata = Metadata::new();
    metadata.insert("file_type".into(), Scalar::Str("txt".into()));
    TextBlock::new(text, metadata)
}

fn corpus_text(topic: &str, paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| {
            format!(
                "Paragraph {i} discusses {topic} in depth, covering practical details, common \
                 mistakes and progression schemes that athletes actually use in training."
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn seed(vectors: &Arc<dyn VectorStore>) -> (String, String) {
    let pipeline = pipeline(vectors.clone());
    let strength = pipeline
        .ingest_text_blocks(
            vec![block(&corpus_text("squat strength and barbell programming", 6))],
            "strength.txt",
            "kb",
            Metadata::new(),
        )
        .await
        .unwrap();
    let nutrition = pipeline
        .ingest_text_blocks(
            vec![block(&corpus_text("protein intake and meal timing", 6))],
            "nutrition.txt",
            "kb",
            Metadata::new(),
        )
        .await
        .unwrap();
    assert_eq!(strength.status, IngestStatus::Success);
    assert_eq!(nutrition.status, IngestStatus::Success);
    (strength.document_id, nutrition.document_id)
}

#[tokio::test(flavor = "multi_thread")]
async fn retrieval_ranks_on_topic_documents_first() {
    let vectors = in_memory_vectors();
    seed(&vectors).await;
    let retriever = retriever(vectors);

    let results = retriever
        .retrieve(
            "how should I program barbell squat strength",
            &SearchScope::Collection("kb".into()),
            &RetrieveOptions::default(),
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].source_file, "strength.txt");
    // Distances are lower-is-better and within [0, 2]
    for chunk in &results {
        assert!(chunk.relevance_score >= 0.0 && chunk.relevance_score <= 2.0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn retrieval_never_empty_when_candidates_exist() {
    let vectors = in_memory_vectors();
    seed(&vectors).await;
    let retriever = retriever(vectors);

    // A query sharing no vocabulary with the corpus: even when everything
    // fails the threshold, the fallback still returns candidates
    let results = retriever
        .retrieve(
            "zzz qqq xxyy unrelated gibberish",
            &SearchScope::Collection("kb".into()),
            &RetrieveOptions::default(),
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_collection_returns_empty_without_error() {
    let vectors = in_memory_vectors();
    vectors.get_or_create_collection("empty").unwrap();
    let retriever = retriever(vectors);

    let results = retriever
        .retrieve(
            "anything at all",
            &SearchScope::Collection("empty".into()),
            &RetrieveOptions::default(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_collection_is_skipped_not_fatal() {
    let vectors = in_memory_vectors();
    seed(&vectors).await;
    let retriever = retriever(vectors);

    let results = retriever
        .retrieve(
            "squat strength programming",
            &SearchScope::Collections(vec!["kb".into(), "does-not-exist".into()]),
            &RetrieveOptions::default(),
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn neighbor_expansion_merges_adjacent_chunks() {
    let vectors = in_memory_vectors();
    let (strength_doc, _) = seed(&vectors).await;
    let retriever = retriever(vectors.clone());

    let results = retriever
        .retrieve(
            "squat strength barbell programming progression",
            &SearchScope::Collection("kb".into()),
            &RetrieveOptions {
                top_k: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The top hit should have been widened with a sibling chunk: its merged
    // content is longer than any single stored chunk of that document
    let stored = vectors
        .get(
            "kb",
            &grounded::vector::MetadataFilter::eq("document_id", strength_doc.as_str()),
            None,
        )
        .unwrap();
    let max_stored = stored.iter().map(|r| r.content.len()).max().unwrap();
    let top = &results[0];
    assert!(
        top.content.len() > max_stored,
        "expected expanded content ({} chars) to exceed any stored chunk ({} chars)",
        top.content.len(),
        max_stored
    );
    assert!(top.metadata.chunk_index().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_all_searches_every_collection() {
    let vectors = in_memory_vectors();
    let pipeline = pipeline(vectors.clone());
    pipeline
        .ingest_text_blocks(
            vec![block(&corpus_text("deadlift technique and hip hinge", 5))],
            "deadlift.txt",
            "col-a",
            Metadata::new(),
        )
        .await
        .unwrap();
    pipeline
        .ingest_text_blocks(
            vec![block(&corpus_text("sleep habits and recovery routines", 5))],
            "sleep.txt",
            "col-b",
            Metadata::new(),
        )
        .await
        .unwrap();

    let retriever = retriever(vectors);
    let results = retriever
        .retrieve(
            "deadlift hip hinge technique",
            &SearchScope::All,
            &RetrieveOptions::default(),
        )
        .await
        .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].source_file, "deadlift.txt");
    // Both collections were visible to the search
    let files: std::collections::HashSet<&str> =
        results.iter().map(|c| c.source_file.as_str()).collect();
    assert!(files.len() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_ingestion_is_single_set_of_chunks() {
    let vectors = in_memory_vectors();
    let pipeline = pipeline(vectors.clone());
    let text = corpus_text("block periodization and fatigue management", 6);

    let first = pipeline
        .ingest_text_blocks(vec![block(&text)], "plan.txt", "kb", Metadata::new())
        .await
        .unwrap();
    let second = pipeline
        .ingest_text_blocks(vec![block(&text)], "plan.txt", "kb", Metadata::new())
        .await
        .unwrap();

    assert_eq!(first.status, IngestStatus::Success);
    assert_eq!(second.status, IngestStatus::Duplicate);
    assert_eq!(second.document_id, first.document_id);
    assert_eq!(second.chunks_created, 0);
    assert_eq!(vectors.count("kb").unwrap(), first.chunks_created);
}
