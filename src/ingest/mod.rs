//! Document ingestion
//!
//! Files and URLs become chunked, embedded, content-addressed records:
//! hash, duplicate check, extract, chunk, enrich, batch-embed, store.

pub mod chunker;
pub mod extract;
mod pipeline;

pub use chunker::{assign_page_numbers, Chunker, MIN_CHUNK_CHARS};
pub use extract::{ExtractorRegistry, WebFetcher};
pub use pipeline::IngestPipeline;
