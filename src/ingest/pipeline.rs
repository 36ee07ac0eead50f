//! The ingestion pipeline
//!
//! Content addressing: files hash their raw bytes, URL sources hash their
//! concatenated extracted text. Within one collection, re-ingesting the same
//! hash is a no-op that returns the existing document id.
//!
//! Embedding asymmetry: each chunk is embedded with a prepended header
//! summarising source/section/title/page, while the stored text stays clean.
//! The embedder gets disambiguating context; the reader never sees it.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::ingest::chunker::{assign_page_numbers, Chunker};
use crate::ingest::extract::{ExtractorRegistry, WebFetcher};
use crate::types::{
    Chunk, IngestOutcome, IngestReport, IngestStatus, Metadata, MetadataExt, Scalar, TextBlock,
};
use crate::vector::{ChunkRecord, MetadataFilter, VectorStore};

pub struct IngestPipeline {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    registry: ExtractorRegistry,
    chunk_size: usize,
    chunk_overlap: usize,
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Embedding header: a compact, `|`-separated summary of where the chunk
/// comes from, in a fixed field order.
fn build_embedding_text(source_name: &str, chunk: &Chunk) -> String {
    let mut parts = vec![format!("source: {}", source_name)];
    let section = chunk
        .metadata
        .section_header()
        .filter(|s| !s.is_empty())
        .or_else(|| chunk.metadata.str_field("heading").filter(|s| !s.is_empty()));
    if let Some(section) = section {
        parts.push(format!("section: {}", section));
    }
    if let Some(title) = chunk.metadata.str_field("title").filter(|s| !s.is_empty()) {
        parts.push(format!("title: {}", title));
    }
    if let Some(page) = chunk.metadata.page_number() {
        parts.push(format!("page: {}", page));
    }
    format!("{}\n{}", parts.join(" | "), chunk.content)
}

impl IngestPipeline {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        registry: ExtractorRegistry,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            vectors,
            embedder,
            registry,
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    /// Duplicate check by content hash within the target collection
    fn find_existing(&self, collection: &str, content_hash: &str) -> Result<Option<String>> {
        let matches = self.vectors.get(
            collection,
            &MetadataFilter::eq("content_hash", content_hash),
            Some(1),
        )?;
        Ok(matches
            .first()
            .and_then(|record| record.metadata.document_id().map(String::from)))
    }

    /// Chunk extracted blocks with the format-appropriate chunker
    fn chunk_blocks(&self, blocks: &[TextBlock]) -> Vec<Chunk> {
        let mut all_chunks = Vec::new();
        for block in blocks {
            let file_type = block.metadata.str_field("file_type").unwrap_or("unknown");
            let chunker = Chunker::for_file_type(file_type, self.chunk_size, self.chunk_overlap);
            let mut chunks = chunker.chunk(&block.content, &block.metadata);
            if file_type == "pdf" {
                chunks = assign_page_numbers(chunks, &block.content);
            }
            all_chunks.extend(chunks);
        }
        all_chunks
    }

    /// Embed and store chunks under a fresh document id
    async fn store_chunks(
        &self,
        collection: &str,
        source_name: &str,
        content_hash: &str,
        mut chunks: Vec<Chunk>,
        extra_metadata: &Metadata,
    ) -> Result<IngestOutcome> {
        if chunks.is_empty() {
            return Ok(IngestOutcome::Empty);
        }

        let document_id = Uuid::new_v4().to_string();
        let total_chunks = chunks.len();

        let enriched: Vec<String> = chunks
            .iter()
            .map(|chunk| build_embedding_text(source_name, chunk))
            .collect();
        let embeddings = self.embedder.embed_batch(&enriched).await?;
        info!("Generated {} embeddings for {}", embeddings.len(), source_name);

        let mut records = Vec::with_capacity(total_chunks);
        for (i, (chunk, embedding)) in chunks.drain(..).zip(embeddings).enumerate() {
            let mut metadata = chunk.metadata;
            for (key, value) in extra_metadata {
                metadata.insert(key.clone(), value.clone());
            }
            metadata.insert("document_id".into(), Scalar::Str(document_id.clone()));
            metadata.insert("source_file".into(), Scalar::Str(source_name.to_string()));
            metadata.insert("content_hash".into(), Scalar::Str(content_hash.to_string()));
            metadata.insert("chunk_index".into(), Scalar::Int(i as i64));
            metadata.insert("total_chunks".into(), Scalar::Int(total_chunks as i64));

            records.push(ChunkRecord {
                id: format!("{}_chunk_{}", document_id, i),
                content: chunk.content,
                embedding,
                metadata,
            });
        }

        self.vectors.add(collection, records)?;
        info!(
            "Stored {} chunks in collection '{}'",
            total_chunks, collection
        );

        Ok(IngestOutcome::Stored {
            document_id,
            chunks_created: total_chunks,
            content_hash: content_hash.to_string(),
        })
    }

    fn report(
        outcome: IngestOutcome,
        filename: &str,
        file_type: &str,
        collection: &str,
    ) -> IngestReport {
        match outcome {
            IngestOutcome::Stored {
                document_id,
                chunks_created,
                content_hash,
            } => IngestReport {
                document_id,
                filename: filename.to_string(),
                file_type: file_type.to_string(),
                chunks_created,
                collection: collection.to_string(),
                content_hash,
                status: IngestStatus::Success,
                error: None,
                job_id: None,
            },
            IngestOutcome::Duplicate {
                document_id,
                content_hash,
            } => IngestReport {
                document_id,
                filename: filename.to_string(),
                file_type: file_type.to_string(),
                chunks_created: 0,
                collection: collection.to_string(),
                content_hash,
                status: IngestStatus::Duplicate,
                error: None,
                job_id: None,
            },
            IngestOutcome::Empty => IngestReport {
                document_id: String::new(),
                filename: filename.to_string(),
                file_type: file_type.to_string(),
                chunks_created: 0,
                collection: collection.to_string(),
                content_hash: String::new(),
                status: IngestStatus::Empty,
                error: None,
                job_id: None,
            },
        }
    }

    /// Ingest a file into a collection
    pub async fn ingest_file(&self, path: &Path, collection: &str) -> Result<IngestReport> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        let file_type = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        info!("Ingesting {} -> collection '{}'", filename, collection);
        self.vectors.get_or_create_collection(collection)?;

        let content_hash = hash_file(path)?;
        if let Some(document_id) = self.find_existing(collection, &content_hash)? {
            info!("Duplicate content for {} (document {})", filename, document_id);
            return Ok(Self::report(
                IngestOutcome::Duplicate {
                    document_id,
                    content_hash,
                },
                &filename,
                &file_type,
                collection,
            ));
        }

        let extractor = self.registry.get(path)?;
        let blocks = extractor.extract(path)?;
        info!("Extracted {} text blocks from {}", blocks.len(), filename);

        let chunks = self.chunk_blocks(&blocks);
        if chunks.is_empty() {
            warn!("No chunks created from {}", filename);
        }
        let outcome = self
            .store_chunks(collection, &filename, &content_hash, chunks, &Metadata::new())
            .await?;
        Ok(Self::report(outcome, &filename, &file_type, collection))
    }

    /// Ingest pre-extracted blocks (web pages, transcripts)
    pub async fn ingest_text_blocks(
        &self,
        blocks: Vec<TextBlock>,
        source_name: &str,
        collection: &str,
        extra_metadata: Metadata,
    ) -> Result<IngestReport> {
        info!("Ingesting {} -> collection '{}'", source_name, collection);
        self.vectors.get_or_create_collection(collection)?;

        let concatenated: String = blocks.iter().map(|b| b.content.as_str()).collect();
        let content_hash = hash_text(&concatenated);
        if let Some(document_id) = self.find_existing(collection, &content_hash)? {
            return Ok(Self::report(
                IngestOutcome::Duplicate {
                    document_id,
                    content_hash,
                },
                source_name,
                "text",
                collection,
            ));
        }

        let chunks = self.chunk_blocks(&blocks);
        let outcome = self
            .store_chunks(collection, source_name, &content_hash, chunks, &extra_metadata)
            .await?;
        Ok(Self::report(outcome, source_name, "text", collection))
    }

    /// Fetch and ingest a web URL (synchronous from the caller's view)
    pub async fn ingest_url(
        &self,
        fetcher: &WebFetcher,
        url: &str,
        collection: &str,
    ) -> Result<IngestReport> {
        let blocks = fetcher.process_url(url).await?;

        let source_url = blocks
            .first()
            .and_then(|b| b.metadata.str_field("source_url"))
            .unwrap_or(url)
            .to_string();
        let parsed = reqwest::Url::parse(&source_url).ok();
        let domain = parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .unwrap_or("unknown");
        let path_part = parsed
            .as_ref()
            .map(|u| u.path().trim_matches('/').replace('/', "_"))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "index".to_string());
        let source_name = format!("{}/{}", domain, path_part);

        let mut extra = Metadata::new();
        extra.insert("source_url".into(), Scalar::Str(source_url));
        extra.insert("source_type".into(), Scalar::Str("web".into()));

        let mut report = self
            .ingest_text_blocks(blocks, &source_name, collection, extra)
            .await?;
        report.file_type = "web".to_string();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::SqliteVectorStore;
    use async_trait::async_trait;

    /// Deterministic embedder: one position per distinct word prefix
    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; 8];
            for (i, byte) in text.bytes().take(64).enumerate() {
                v[i % 8] += byte as f32 / 255.0;
            }
            Ok(v)
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn model_name(&self) -> &str {
            "stub"
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn pipeline(vectors: Arc<dyn VectorStore>) -> IngestPipeline {
        IngestPipeline::new(
            vectors,
            Arc::new(StubEmbedder),
            ExtractorRegistry::new(),
            200,
            50,
        )
    }

    fn long_text() -> String {
        (0..40)
            .map(|i| format!("Paragraph {} explains the finer points of block periodization.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[tokio::test]
    async fn test_ingest_and_duplicate() {
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        let pipeline = pipeline(vectors.clone());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        std::fs::write(&path, long_text()).unwrap();

        let first = pipeline.ingest_file(&path, "kb").await.unwrap();
        assert_eq!(first.status, IngestStatus::Success);
        assert!(first.chunks_created >= 1);
        assert!(!first.document_id.is_empty());

        let second = pipeline.ingest_file(&path, "kb").await.unwrap();
        assert_eq!(second.status, IngestStatus::Duplicate);
        assert_eq!(second.document_id, first.document_id);
        assert_eq!(second.chunks_created, 0);

        // Exactly one set of chunks exists
        assert_eq!(vectors.count("kb").unwrap(), first.chunks_created);
    }

    #[tokio::test]
    async fn test_chunk_index_contiguous_with_total() {
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        let pipeline = pipeline(vectors.clone());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        std::fs::write(&path, long_text()).unwrap();
        let report = pipeline.ingest_file(&path, "kb").await.unwrap();

        let records = vectors
            .get("kb", &MetadataFilter::eq("document_id", report.document_id.as_str()), None)
            .unwrap();
        assert_eq!(records.len(), report.chunks_created);
        let mut indices: Vec<i64> = records
            .iter()
            .filter_map(|r| r.metadata.chunk_index())
            .collect();
        indices.sort_unstable();
        let expected: Vec<i64> = (0..report.chunks_created as i64).collect();
        assert_eq!(indices, expected);
        for record in &records {
            assert_eq!(
                record.metadata.int_field("total_chunks"),
                Some(report.chunks_created as i64)
            );
            assert!(record.content.chars().count() >= crate::ingest::MIN_CHUNK_CHARS);
            assert_eq!(record.id, format!(
                "{}_chunk_{}",
                report.document_id,
                record.metadata.chunk_index().unwrap()
            ));
        }
    }

    #[tokio::test]
    async fn test_empty_source() {
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        let pipeline = pipeline(vectors.clone());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.txt");
        std::fs::write(&path, "too small").unwrap();

        let report = pipeline.ingest_file(&path, "kb").await.unwrap();
        assert_eq!(report.status, IngestStatus::Empty);
        assert_eq!(vectors.count("kb").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_text_blocks_hash_over_content() {
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        let pipeline = pipeline(vectors.clone());

        let make_blocks = || {
            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("web".into()));
            vec![TextBlock::new(long_text(), metadata)]
        };

        let first = pipeline
            .ingest_text_blocks(make_blocks(), "site/page", "kb", Metadata::new())
            .await
            .unwrap();
        assert_eq!(first.status, IngestStatus::Success);

        let second = pipeline
            .ingest_text_blocks(make_blocks(), "site/other-name", "kb", Metadata::new())
            .await
            .unwrap();
        assert_eq!(second.status, IngestStatus::Duplicate);
        assert_eq!(second.document_id, first.document_id);
    }

    #[test]
    fn test_embedding_header_order() {
        let mut metadata = Metadata::new();
        metadata.insert("section_header".into(), Scalar::Str("Strength".into()));
        metadata.insert("title".into(), Scalar::Str("Guide".into()));
        metadata.insert("page_number".into(), Scalar::Int(3));
        let chunk = Chunk {
            content: "Squat twice a week.".into(),
            metadata,
        };
        let text = build_embedding_text("guide.pdf", &chunk);
        assert!(text.starts_with(
            "source: guide.pdf | section: Strength | title: Guide | page: 3\n"
        ));
        assert!(text.ends_with("Squat twice a week."));
    }
}
