//! Embedded SQLite-backed vector store
//!
//! Embeddings are stored as little-endian f32 blobs; queries load the
//! collection's vectors and score cosine distance in process. Adequate for
//! single-node collections in the tens of thousands of chunks.

use std::collections::BinaryHeap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::{GroundedError, Result};
use crate::types::Metadata;

use super::{
    cosine_distance, ChunkRecord, MetadataFilter, ScoredChunk, VectorStore, DELETE_BATCH_SIZE,
};

pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Max-heap entry keyed on distance so the heap root is the worst candidate
struct HeapEntry {
    distance: f32,
    chunk: ScoredChunk,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl SqliteVectorStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;

            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dimension INTEGER DEFAULT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (collection) REFERENCES collections(name)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn require_collection(conn: &Connection, name: &str) -> Result<()> {
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(GroundedError::NotFound(format!("Collection '{}'", name)));
        }
        Ok(())
    }
}

impl VectorStore for SqliteVectorStore {
    fn get_or_create_collection(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
            params![name],
        )?;
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn add(&self, collection: &str, records: Vec<ChunkRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
            params![collection],
        )?;

        // Dimension homogeneity: the first insert pins the collection's
        // dimension; later inserts must match it exactly.
        let incoming_dim = records[0].embedding.len();
        if incoming_dim == 0 {
            return Err(GroundedError::InvalidInput(
                "Cannot store empty embeddings".into(),
            ));
        }
        if let Some(mismatch) = records.iter().find(|r| r.embedding.len() != incoming_dim) {
            return Err(GroundedError::InvalidInput(format!(
                "Mixed embedding dimensions in one batch: {} vs {}",
                incoming_dim,
                mismatch.embedding.len()
            )));
        }
        let existing_dim: Option<i64> = tx.query_row(
            "SELECT dimension FROM collections WHERE name = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        match existing_dim {
            None => {
                tx.execute(
                    "UPDATE collections SET dimension = ?1 WHERE name = ?2",
                    params![incoming_dim as i64, collection],
                )?;
            }
            Some(dim) if dim as usize != incoming_dim => {
                return Err(GroundedError::InvalidInput(format!(
                    "Collection '{}' stores {}-dimensional embeddings, got {}",
                    collection, dim, incoming_dim
                )));
            }
            Some(_) => {}
        }

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO chunks (id, collection, content, embedding, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in &records {
                stmt.execute(params![
                    record.id,
                    collection,
                    record.content,
                    embedding_to_blob(&record.embedding),
                    serde_json::to_string(&record.metadata)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n_results: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, collection)?;
        if n_results == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = conn
            .prepare("SELECT id, content, embedding, metadata FROM chunks WHERE collection = ?1")?;
        let rows = stmt.query_map(params![collection], |row| {
            let blob: Vec<u8> = row.get(2)?;
            let metadata: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                blob,
                metadata,
            ))
        })?;

        // Keep only the n_results best candidates while scanning
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(n_results + 1);
        for row in rows {
            let (id, content, blob, metadata_raw) = row?;
            let stored = blob_to_embedding(&blob);
            let distance = cosine_distance(embedding, &stored);
            let metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();
            heap.push(HeapEntry {
                distance,
                chunk: ScoredChunk {
                    id,
                    content,
                    metadata,
                    distance,
                },
            });
            if heap.len() > n_results {
                heap.pop();
            }
        }

        let mut results: Vec<ScoredChunk> = heap.into_iter().map(|e| e.chunk).collect();
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    fn get(
        &self,
        collection: &str,
        filter: &MetadataFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, collection)?;

        let mut stmt = conn
            .prepare("SELECT id, content, embedding, metadata FROM chunks WHERE collection = ?1")?;
        let rows = stmt.query_map(params![collection], |row| {
            let blob: Vec<u8> = row.get(2)?;
            let metadata: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                blob,
                metadata,
            ))
        })?;

        let cap = limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        for row in rows {
            if results.len() >= cap {
                break;
            }
            let (id, content, blob, metadata_raw) = row?;
            let metadata: Metadata = serde_json::from_str(&metadata_raw).unwrap_or_default();
            if filter.matches(&metadata) {
                results.push(ChunkRecord {
                    id,
                    content,
                    embedding: blob_to_embedding(&blob),
                    metadata,
                });
            }
        }
        Ok(results)
    }

    fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, collection)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let conn = self.conn.lock();
        Self::require_collection(&conn, collection)?;
        let mut removed = 0usize;
        for batch in ids.chunks(DELETE_BATCH_SIZE) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "DELETE FROM chunks WHERE collection = ? AND id IN ({})",
                placeholders
            );
            let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&collection];
            for id in batch {
                params_vec.push(id);
            }
            removed += conn.execute(&sql, params_vec.as_slice())?;
        }
        Ok(removed)
    }

    fn delete_collection(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chunks WHERE collection = ?1", params![name])?;
        let n = conn.execute("DELETE FROM collections WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;

    fn record(id: &str, content: &str, embedding: Vec<f32>, doc: &str, index: i64) -> ChunkRecord {
        let mut metadata = Metadata::new();
        metadata.insert("document_id".into(), Scalar::Str(doc.into()));
        metadata.insert("chunk_index".into(), Scalar::Int(index));
        ChunkRecord {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata,
        }
    }

    #[test]
    fn test_blob_roundtrip() {
        let embedding = vec![0.25f32, -1.5, 3.75];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&embedding)), embedding);
    }

    #[test]
    fn test_query_orders_by_distance() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .add(
                "kb",
                vec![
                    record("a", "exact", vec![1.0, 0.0], "d1", 0),
                    record("b", "orthogonal", vec![0.0, 1.0], "d1", 1),
                    record("c", "close", vec![0.9, 0.1], "d1", 2),
                ],
            )
            .unwrap();

        let results = store.query("kb", &[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[1].id, "c");
        assert!(results[0].distance < results[1].distance);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .add("kb", vec![record("a", "x", vec![1.0, 0.0], "d1", 0)])
            .unwrap();
        let result = store.add("kb", vec![record("b", "y", vec![1.0, 0.0, 0.0], "d1", 1)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_filtered_get() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        store
            .add(
                "kb",
                vec![
                    record("a", "x", vec![1.0], "d1", 0),
                    record("b", "y", vec![1.0], "d1", 1),
                    record("c", "z", vec![1.0], "d2", 0),
                ],
            )
            .unwrap();

        let hits = store
            .get("kb", &MetadataFilter::eq("document_id", "d1"), None)
            .unwrap();
        assert_eq!(hits.len(), 2);

        let limited = store
            .get("kb", &MetadataFilter::eq("document_id", "d1"), Some(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_delete_batches_and_collection_drop() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        let records: Vec<ChunkRecord> = (0..1200)
            .map(|i| record(&format!("id-{}", i), "x", vec![1.0], "d1", i))
            .collect();
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        store.add("kb", records).unwrap();
        assert_eq!(store.count("kb").unwrap(), 1200);

        let removed = store.delete("kb", &ids).unwrap();
        assert_eq!(removed, 1200);
        assert_eq!(store.count("kb").unwrap(), 0);

        assert!(store.delete_collection("kb").unwrap());
        assert!(!store.has_collection("kb").unwrap());
        assert!(!store.delete_collection("kb").unwrap());
    }

    #[test]
    fn test_query_missing_collection_errors() {
        let store = SqliteVectorStore::open_in_memory().unwrap();
        assert!(store.query("nope", &[1.0], 5).is_err());
    }
}
