//! Grounded - Retrieval-Augmented Question Answering
//!
//! Ingests heterogeneous documents into an embedded vector index and answers
//! questions with grounded, cited, streamed responses. Chat sessions carry
//! conversational memory with cached rolling summaries.

pub mod chat;
pub mod config;
pub mod embedding;
pub mod error;
pub mod http;
pub mod ingest;
pub mod jobs;
pub mod llm;
pub mod retrieval;
pub mod store;
pub mod types;
pub mod vector;

pub use config::Settings;
pub use error::{GroundedError, Result};
pub use store::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
