//! Core types for Grounded

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scalar metadata value
///
/// Chunk metadata is an open map of scalars; compound values are coerced to
/// their string form before storage so every stored value round-trips as one
/// of these four variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) => Some(*f as i64),
            Scalar::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(f) => Some(*f),
            Scalar::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Coerce an arbitrary JSON value into a scalar, stringifying compounds
    pub fn sanitize(value: &serde_json::Value) -> Scalar {
        match value {
            serde_json::Value::Bool(b) => Scalar::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Scalar::Int(i)
                } else {
                    Scalar::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Scalar::Str(s.clone()),
            other => Scalar::Str(other.to_string()),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<usize> for Scalar {
    fn from(i: usize) -> Self {
        Scalar::Int(i as i64)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Open metadata map attached to chunks and text blocks
pub type Metadata = HashMap<String, Scalar>;

/// Typed accessors for the well-known metadata fields
pub trait MetadataExt {
    fn str_field(&self, key: &str) -> Option<&str>;
    fn int_field(&self, key: &str) -> Option<i64>;

    fn document_id(&self) -> Option<&str> {
        self.str_field("document_id")
    }
    fn source_file(&self) -> Option<&str> {
        self.str_field("source_file")
    }
    fn content_hash(&self) -> Option<&str> {
        self.str_field("content_hash")
    }
    fn chunk_index(&self) -> Option<i64> {
        self.int_field("chunk_index")
    }
    fn page_number(&self) -> Option<i64> {
        self.int_field("page_number")
    }
    fn section_header(&self) -> Option<&str> {
        self.str_field("section_header")
    }
}

impl MetadataExt for Metadata {
    fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    fn int_field(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }
}

/// A block of extracted text with format-specific metadata
#[derive(Debug, Clone)]
pub struct TextBlock {
    pub content: String,
    pub metadata: Metadata,
}

impl TextBlock {
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }
}

/// A chunk produced by the chunker, ready for enrichment and embedding
#[derive(Debug, Clone)]
pub struct Chunk {
    pub content: String,
    pub metadata: Metadata,
}

/// A chunk returned by retrieval. `relevance_score` is a distance:
/// lower = more relevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub metadata: Metadata,
    pub relevance_score: f32,
    pub source_file: String,
}

/// Source reference shown to clients alongside an answer.
/// `relevance_score` here is a display similarity in [0, 1]: higher = better.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub filename: String,
    pub chunk_text: String,
    pub relevance_score: f32,
    pub metadata: Metadata,
}

impl SourceRef {
    /// Build the display reference for a retrieved chunk
    pub fn from_chunk(chunk: &RetrievedChunk) -> Self {
        let preview: String = if chunk.content.chars().count() > 200 {
            let cut: String = chunk.content.chars().take(200).collect();
            format!("{}...", cut)
        } else {
            chunk.content.clone()
        };
        Self {
            filename: chunk.source_file.clone(),
            chunk_text: preview,
            relevance_score: ((1.0 - chunk.relevance_score).clamp(0.0, 1.0) * 10_000.0).round()
                / 10_000.0,
            metadata: chunk.metadata.clone(),
        }
    }
}

/// Terminal state of an ingestion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Processing,
    Success,
    Duplicate,
    Empty,
    Error,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Processing => "processing",
            IngestStatus::Success => "success",
            IngestStatus::Duplicate => "duplicate",
            IngestStatus::Empty => "empty",
            IngestStatus::Error => "error",
        }
    }
}

/// Outcome of running the ingestion pipeline on one source
///
/// Duplicate and empty sources are outcomes, not errors; only infrastructure
/// faults propagate as `Err`.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Stored {
        document_id: String,
        chunks_created: usize,
        content_hash: String,
    },
    Duplicate {
        document_id: String,
        content_hash: String,
    },
    Empty,
}

/// Summary of an ingestion, as reported over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub filename: String,
    pub file_type: String,
    pub chunks_created: usize,
    pub collection: String,
    pub content_hash: String,
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl IngestReport {
    pub fn error(filename: &str, collection: &str, msg: String) -> Self {
        Self {
            document_id: String::new(),
            filename: filename.to_string(),
            file_type: String::new(),
            chunks_created: 0,
            collection: collection.to_string(),
            content_hash: String::new(),
            status: IngestStatus::Error,
            error: Some(msg),
            job_id: None,
        }
    }
}

/// A chat session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub collection: Option<String>,
    pub agent_id: Option<String>,
    /// JSON blob holding the rolling summary and attachment bindings
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub message_count: i64,
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// A message within a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    pub created_at: DateTime<Utc>,
}

/// A reusable persona bound to sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    /// Allow-list of collections to search; empty = search all
    #[serde(default)]
    pub collections: Vec<String>,
    pub temperature: f32,
    pub top_k: usize,
    pub icon: String,
    #[serde(default)]
    pub use_multi_query: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A folder in a collection's document tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub collection: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Feedback polarity for an assistant message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Positive,
    Negative,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Positive => "positive",
            FeedbackKind::Negative => "negative",
        }
    }
}

impl std::str::FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "positive" => Ok(FeedbackKind::Positive),
            "negative" => Ok(FeedbackKind::Negative),
            _ => Err(format!("Invalid feedback value: {}", s)),
        }
    }
}

/// What kind of provider call a usage row records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Chat,
    Whisper,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Chat => "chat",
            CallType::Whisper => "whisper",
        }
    }
}

/// One provider call, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub call_type: CallType,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub audio_seconds: f64,
    pub estimated_cost: f64,
}

/// Background ingestion job state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: IngestStatus,
    pub filename: String,
    pub collection: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<IngestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collection summary for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub document_count: usize,
    pub total_chunks: usize,
}

/// Take at most `n` characters from the front of `s`, respecting char
/// boundaries. Used for dedup keys and previews.
pub fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sanitize() {
        assert_eq!(
            Scalar::sanitize(&serde_json::json!("x")),
            Scalar::Str("x".into())
        );
        assert_eq!(Scalar::sanitize(&serde_json::json!(3)), Scalar::Int(3));
        assert_eq!(
            Scalar::sanitize(&serde_json::json!(true)),
            Scalar::Bool(true)
        );
        // Compound values are stringified
        assert_eq!(
            Scalar::sanitize(&serde_json::json!([1, 2])),
            Scalar::Str("[1,2]".into())
        );
    }

    #[test]
    fn test_char_prefix_multibyte() {
        let s = "héllo wörld";
        assert_eq!(char_prefix(s, 4), "héll");
        assert_eq!(char_prefix("ab", 10), "ab");
    }

    #[test]
    fn test_source_ref_preview_truncation() {
        let chunk = RetrievedChunk {
            content: "x".repeat(300),
            metadata: Metadata::new(),
            relevance_score: 0.25,
            source_file: "a.pdf".into(),
        };
        let sr = SourceRef::from_chunk(&chunk);
        assert_eq!(sr.chunk_text.chars().count(), 203); // 200 + "..."
        assert!((sr.relevance_score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_metadata_accessors() {
        let mut meta = Metadata::new();
        meta.insert("chunk_index".into(), Scalar::Int(4));
        meta.insert("source_file".into(), Scalar::Str("doc.pdf".into()));
        assert_eq!(meta.chunk_index(), Some(4));
        assert_eq!(meta.source_file(), Some("doc.pdf"));
        assert_eq!(meta.page_number(), None);
    }
}
