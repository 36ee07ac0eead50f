//! Error types for Grounded

use thiserror::Error;

/// Result type alias for Grounded operations
pub type Result<T> = std::result::Result<T, GroundedError>;

/// Main error type for Grounded
#[derive(Error, Debug)]
pub enum GroundedError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("All LLM providers unavailable: {0}")]
    ProvidersExhausted(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Blocked URL: {0}")]
    BlockedUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GroundedError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GroundedError::Http(_) | GroundedError::Provider(_) | GroundedError::RateLimited(_)
        )
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GroundedError::NotFound(_) => 404,
            GroundedError::InvalidInput(_) | GroundedError::UnsupportedFileType(_) => 400,
            GroundedError::Auth(_) => 401,
            GroundedError::RateLimited(_) => 429,
            GroundedError::EmbeddingUnavailable(_)
            | GroundedError::ProvidersExhausted(_)
            | GroundedError::BlockedUrl(_) => 503,
            _ => 500,
        }
    }

    /// Message safe to show to API clients. Infrastructure details stay in logs.
    pub fn public_message(&self) -> String {
        match self {
            GroundedError::NotFound(_)
            | GroundedError::InvalidInput(_)
            | GroundedError::UnsupportedFileType(_)
            | GroundedError::Auth(_)
            | GroundedError::RateLimited(_)
            | GroundedError::EmbeddingUnavailable(_)
            | GroundedError::ProvidersExhausted(_)
            | GroundedError::BlockedUrl(_) => self.to_string(),
            _ => "An internal error occurred while processing the request.".to_string(),
        }
    }
}
