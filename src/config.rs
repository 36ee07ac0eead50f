//! Typed, environment-backed service configuration

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Service configuration
///
/// Every field has a working default; deployment overrides come from the
/// environment (see `Settings::from_env`) or the server CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Authentication
    pub auth_enabled: bool,
    pub auth_token: String,

    // LLM providers (each enabled iff its key is set)
    pub groq_api_key: Option<String>,
    pub groq_model: String,
    pub groq_timeout_secs: u64,
    pub cerebras_api_key: Option<String>,
    pub cerebras_model: String,
    pub cerebras_timeout_secs: u64,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_timeout_secs: u64,
    /// Primary provider label ("groq", "cerebras" or "openrouter")
    pub llm_provider: String,

    // Embeddings
    pub embedding_base_url: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    /// Fixed dimension for the whole deployment; the client refuses vectors
    /// of any other length.
    pub embedding_dimensions: usize,
    pub embedding_timeout_secs: u64,

    // Cross-encoder reranker (optional)
    pub rerank_base_url: Option<String>,
    pub rerank_model: String,

    // Storage
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,

    // Chunking
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Upload
    pub max_file_size_mb: u64,

    // Retrieval
    pub top_k: usize,
    pub max_top_k: usize,
    pub max_context_chunks: usize,
    pub similarity_threshold: f32,

    // Chat
    pub summarize_after_messages: usize,

    // HTTP
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("grounded");
        Self {
            auth_enabled: true,
            auth_token: String::new(),
            groq_api_key: None,
            groq_model: "llama-3.3-70b-versatile".to_string(),
            groq_timeout_secs: 60,
            cerebras_api_key: None,
            cerebras_model: "llama-3.3-70b".to_string(),
            cerebras_timeout_secs: 60,
            openrouter_api_key: None,
            openrouter_model: "meta-llama/llama-3.3-70b-instruct:free".to_string(),
            openrouter_timeout_secs: 90,
            llm_provider: "groq".to_string(),
            embedding_base_url: "http://localhost:11434".to_string(),
            embedding_api_key: None,
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dimensions: 768,
            embedding_timeout_secs: 120,
            rerank_base_url: None,
            rerank_model: "ms-marco-MiniLM-L-6-v2".to_string(),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            chunk_size: 1000,
            chunk_overlap: 200,
            max_file_size_mb: 100,
            top_k: 15,
            max_top_k: 50,
            max_context_chunks: 30,
            similarity_threshold: 0.65,
            summarize_after_messages: 20,
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_origins: vec![
                "http://localhost:8000".to_string(),
                "http://127.0.0.1:8000".to_string(),
            ],
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            auth_enabled: env_or("AUTH_ENABLED", defaults.auth_enabled),
            auth_token: env_opt("AUTH_TOKEN").unwrap_or_default(),
            groq_api_key: env_opt("GROQ_API_KEY"),
            groq_model: env_or("GROQ_MODEL", defaults.groq_model),
            groq_timeout_secs: env_or("GROQ_TIMEOUT_SECS", defaults.groq_timeout_secs),
            cerebras_api_key: env_opt("CEREBRAS_API_KEY"),
            cerebras_model: env_or("CEREBRAS_MODEL", defaults.cerebras_model),
            cerebras_timeout_secs: env_or("CEREBRAS_TIMEOUT_SECS", defaults.cerebras_timeout_secs),
            openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
            openrouter_model: env_or("OPENROUTER_MODEL", defaults.openrouter_model),
            openrouter_timeout_secs: env_or(
                "OPENROUTER_TIMEOUT_SECS",
                defaults.openrouter_timeout_secs,
            ),
            llm_provider: env_or("LLM_PROVIDER", defaults.llm_provider),
            embedding_base_url: env_or("EMBEDDING_BASE_URL", defaults.embedding_base_url),
            embedding_api_key: env_opt("EMBEDDING_API_KEY"),
            embedding_model: env_or("EMBEDDING_MODEL", defaults.embedding_model),
            embedding_dimensions: env_or("EMBEDDING_DIMENSIONS", defaults.embedding_dimensions),
            embedding_timeout_secs: env_or(
                "EMBEDDING_TIMEOUT_SECS",
                defaults.embedding_timeout_secs,
            ),
            rerank_base_url: env_opt("RERANK_BASE_URL"),
            rerank_model: env_or("RERANK_MODEL", defaults.rerank_model),
            data_dir: env_opt("GROUNDED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            upload_dir: env_opt("GROUNDED_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            chunk_size: env_or("CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: env_or("CHUNK_OVERLAP", defaults.chunk_overlap),
            max_file_size_mb: env_or("MAX_FILE_SIZE_MB", defaults.max_file_size_mb),
            top_k: env_or("TOP_K", defaults.top_k),
            max_top_k: env_or("MAX_TOP_K", defaults.max_top_k),
            max_context_chunks: env_or("MAX_CONTEXT_CHUNKS", defaults.max_context_chunks),
            similarity_threshold: env_or("SIMILARITY_THRESHOLD", defaults.similarity_threshold),
            summarize_after_messages: env_or(
                "SUMMARIZE_AFTER_MESSAGES",
                defaults.summarize_after_messages,
            ),
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr),
            cors_origins: env_opt("CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
        }
    }

    /// Maximum upload size in bytes
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Path of the metadata database file
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }

    /// Path of the vector store database file
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.chunk_size, 1000);
        assert_eq!(s.chunk_overlap, 200);
        assert_eq!(s.similarity_threshold, 0.65);
        assert_eq!(s.top_k, 15);
        assert_eq!(s.summarize_after_messages, 20);
        assert!(s.auth_enabled);
    }

    #[test]
    fn test_upload_bytes() {
        let s = Settings::default();
        assert_eq!(s.max_upload_bytes(), 100 * 1024 * 1024);
    }
}
