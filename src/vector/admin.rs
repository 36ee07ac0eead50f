//! Collection management helpers
//!
//! Document-level views over the chunk store: collections are summarised by
//! scanning chunk metadata (documents exist only as groups of chunks).

use std::collections::HashMap;

use tracing::{error, info};

use crate::error::Result;
use crate::types::{CollectionInfo, Metadata, MetadataExt, Scalar};

use super::{MetadataFilter, VectorStore};

/// Summary of one document inside a collection
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentInfo {
    pub document_id: String,
    pub filename: String,
    pub file_type: String,
    pub total_chunks: i64,
}

/// All collections with document/chunk counts
pub fn get_all_collections(store: &dyn VectorStore) -> Result<Vec<CollectionInfo>> {
    let mut result = Vec::new();
    for name in store.list_collections()? {
        match collection_info(store, &name) {
            Ok(info) => result.push(info),
            Err(e) => {
                error!("Error reading collection '{}': {}", name, e);
                result.push(CollectionInfo {
                    name,
                    document_count: 0,
                    total_chunks: 0,
                });
            }
        }
    }
    Ok(result)
}

pub fn collection_info(store: &dyn VectorStore, name: &str) -> Result<CollectionInfo> {
    let total_chunks = store.count(name)?;
    let mut document_ids = std::collections::HashSet::new();
    if total_chunks > 0 {
        for record in store.get(name, &MetadataFilter::default(), None)? {
            if let Some(document_id) = record.metadata.document_id() {
                document_ids.insert(document_id.to_string());
            }
        }
    }
    Ok(CollectionInfo {
        name: name.to_string(),
        document_count: document_ids.len(),
        total_chunks,
    })
}

/// Unique documents in a collection
pub fn get_collection_documents(
    store: &dyn VectorStore,
    name: &str,
) -> Result<Vec<DocumentInfo>> {
    let mut documents: HashMap<String, DocumentInfo> = HashMap::new();
    let mut order = Vec::new();
    for record in store.get(name, &MetadataFilter::default(), None)? {
        let Some(document_id) = record.metadata.document_id() else {
            continue;
        };
        if !documents.contains_key(document_id) {
            order.push(document_id.to_string());
            documents.insert(
                document_id.to_string(),
                DocumentInfo {
                    document_id: document_id.to_string(),
                    filename: record
                        .metadata
                        .source_file()
                        .unwrap_or("unknown")
                        .to_string(),
                    file_type: record
                        .metadata
                        .str_field("file_type")
                        .unwrap_or("unknown")
                        .to_string(),
                    total_chunks: record.metadata.int_field("total_chunks").unwrap_or(0),
                },
            );
        }
    }
    Ok(order
        .into_iter()
        .filter_map(|id| documents.remove(&id))
        .collect())
}

/// Chunks of one document, sorted by chunk_index
pub fn get_document_chunks(
    store: &dyn VectorStore,
    collection: &str,
    document_id: &str,
    limit: usize,
) -> Result<Vec<(String, String, i64, Metadata)>> {
    let mut chunks: Vec<(String, String, i64, Metadata)> = store
        .get(
            collection,
            &MetadataFilter::eq("document_id", document_id),
            Some(limit),
        )?
        .into_iter()
        .map(|record| {
            let index = record.metadata.chunk_index().unwrap_or(0);
            (record.id, record.content, index, record.metadata)
        })
        .collect();
    chunks.sort_by_key(|(_, _, index, _)| *index);
    Ok(chunks)
}

/// Delete every chunk of a document. Returns chunks removed.
pub fn delete_document(
    store: &dyn VectorStore,
    collection: &str,
    document_id: &str,
) -> Result<usize> {
    let ids: Vec<String> = store
        .get(
            collection,
            &MetadataFilter::eq("document_id", document_id),
            None,
        )?
        .into_iter()
        .map(|record| record.id)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    store.delete(collection, &ids)
}

/// Delete all chunks below a character threshold. Returns chunks removed.
pub fn cleanup_micro_chunks(
    store: &dyn VectorStore,
    collection: &str,
    min_chars: usize,
) -> Result<usize> {
    let ids: Vec<String> = store
        .get(collection, &MetadataFilter::default(), None)?
        .into_iter()
        .filter(|record| record.content.trim().chars().count() < min_chars)
        .map(|record| record.id)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let removed = store.delete(collection, &ids)?;
    info!(
        "Cleanup removed {} micro-chunks from '{}' (min {} chars)",
        removed, collection, min_chars
    );
    Ok(removed)
}

/// Mark a metadata map as belonging to a document; shared by tests
pub fn document_metadata(document_id: &str, source_file: &str, chunk_index: i64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("document_id".into(), Scalar::Str(document_id.into()));
    metadata.insert("source_file".into(), Scalar::Str(source_file.into()));
    metadata.insert("chunk_index".into(), Scalar::Int(chunk_index));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{ChunkRecord, SqliteVectorStore};

    fn seed(store: &SqliteVectorStore) {
        let records: Vec<ChunkRecord> = (0..4)
            .map(|i| {
                let mut metadata = document_metadata("d1", "plan.pdf", i);
                metadata.insert("total_chunks".into(), Scalar::Int(4));
                ChunkRecord {
                    id: format!("d1_chunk_{}", i),
                    content: if i == 3 {
                        "tiny".to_string()
                    } else {
                        format!("chunk {} with plenty of real content inside it", i)
                    },
                    embedding: vec![1.0, 0.0],
                    metadata,
                }
            })
            .collect();
        store.add("kb", records).unwrap();
    }

    #[test]
    fn test_collection_and_document_views() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        seed(&store);

        let collections = get_all_collections(&store).unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].document_count, 1);
        assert_eq!(collections[0].total_chunks, 4);

        let documents = get_collection_documents(&store, "kb").unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].filename, "plan.pdf");

        let chunks = get_document_chunks(&store, "kb", "d1", 500).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].2, 0);
        assert_eq!(chunks[3].2, 3);
    }

    #[test]
    fn test_cleanup_and_delete() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        seed(&store);

        let removed = cleanup_micro_chunks(&store, "kb", 10).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("kb").unwrap(), 3);

        let removed = delete_document(&store, "kb", "d1").unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.count("kb").unwrap(), 0);
    }
}
