//! PDF text extraction
//!
//! All pages are joined into one continuous text so chunks can span page
//! boundaries; `<!-- PAGE N -->` markers between pages let the chunker
//! recover page numbers afterwards.

use std::path::Path;

use crate::error::{GroundedError, Result};
use crate::ingest::chunker::page_marker;
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        vec![".pdf"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let bytes = std::fs::read(path)?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| GroundedError::Extraction(format!("PDF extraction failed: {}", e)))?;

        // pdf-extract separates pages with form feeds
        let pages: Vec<&str> = if text.contains('\x0C') {
            text.split('\x0C').collect()
        } else {
            vec![text.as_str()]
        };
        let total_pages = pages.len();

        let mut parts = Vec::new();
        for (i, page_text) in pages.iter().enumerate() {
            let trimmed = page_text.trim();
            if trimmed.is_empty() {
                continue;
            }
            parts.push(format!("{}\n{}", page_marker(i + 1), trimmed));
        }

        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), Scalar::Str("pdf".into()));
        metadata.insert("total_pages".into(), Scalar::Int(total_pages as i64));

        if parts.is_empty() {
            return Ok(vec![TextBlock::new(
                "[No extractable text found in PDF]",
                metadata,
            )]);
        }

        Ok(vec![TextBlock::new(parts.join("\n\n"), metadata)])
    }
}
