//! Format-specific text extractors
//!
//! Each extractor turns one file format into text blocks carrying
//! format-specific metadata (page markers for PDF, section hierarchy for
//! Markdown, heading for DOCX, row ranges for CSV, language and definition
//! name for code, timestamped segments for audio).

mod audio;
mod code;
mod docx;
mod json;
mod pdf;
mod spreadsheet;
mod text;
pub mod web;

pub use audio::AudioExtractor;
pub use code::CodeExtractor;
pub use docx::DocxExtractor;
pub use json::JsonExtractor;
pub use pdf::PdfExtractor;
pub use spreadsheet::SpreadsheetExtractor;
pub use text::TextExtractor;
pub use web::WebFetcher;

use std::path::Path;
use std::sync::Arc;

use crate::error::{GroundedError, Result};
use crate::types::TextBlock;

/// A format-specific text extractor
pub trait Extractor: Send + Sync {
    /// Supported file extensions, lowercase, with dot (".pdf")
    fn extensions(&self) -> Vec<&'static str>;

    /// Extract text blocks from a file
    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>>;
}

/// Extension-keyed extractor registry
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Registry with every extractor that has no external runtime
    /// requirement. Audio needs a transcription-capable provider and is
    /// registered separately by the composition root.
    pub fn new() -> Self {
        Self {
            extractors: vec![
                Arc::new(TextExtractor),
                Arc::new(PdfExtractor),
                Arc::new(DocxExtractor),
                Arc::new(SpreadsheetExtractor),
                Arc::new(JsonExtractor),
                Arc::new(CodeExtractor),
            ],
        }
    }

    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub fn get(&self, path: &Path) -> Result<Arc<dyn Extractor>> {
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        self.extractors
            .iter()
            .find(|p| p.extensions().contains(&ext.as_str()))
            .cloned()
            .ok_or_else(|| {
                GroundedError::UnsupportedFileType(format!(
                    "No extractor for '{}'. Supported: {}",
                    ext,
                    self.supported_extensions().join(", ")
                ))
            })
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.get(path).is_ok()
    }

    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self
            .extractors
            .iter()
            .flat_map(|p| p.extensions())
            .map(String::from)
            .collect();
        extensions.sort();
        extensions
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_dispatch() {
        let registry = ExtractorRegistry::new();
        assert!(registry.supports(Path::new("doc.pdf")));
        assert!(registry.supports(Path::new("notes.MD")));
        assert!(registry.supports(Path::new("data.csv")));
        assert!(!registry.supports(Path::new("video.mp4")));
        assert!(!registry.supports(Path::new("no_extension")));
    }

    #[test]
    fn test_supported_extensions_sorted() {
        let registry = ExtractorRegistry::new();
        let extensions = registry.supported_extensions();
        assert!(extensions.contains(&".pdf".to_string()));
        let mut sorted = extensions.clone();
        sorted.sort();
        assert_eq!(extensions, sorted);
    }
}
