//! DOCX extraction
//!
//! A .docx file is a zip archive; the document body lives in
//! word/document.xml. Paragraph runs are pulled with regexes, grouped under
//! their nearest Heading-styled paragraph, and tables are emitted as
//! pipe-separated rows.

use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{GroundedError, Result};
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

static PARAGRAPH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>|<w:p/>").expect("valid regex"));
static RUN_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:t[^>]*>(.*?)</w:t>").expect("valid regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<w:pStyle[^>]*w:val="([^"]+)""#).expect("valid regex"));
static TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:tbl>.*?</w:tbl>").expect("valid regex"));
static ROW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<w:tr[ >].*?</w:tr>").expect("valid regex"));
static CELL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<w:tc>.*?</w:tc>").expect("valid regex"));

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

fn paragraph_text(xml: &str) -> String {
    let mut text = String::new();
    for cap in RUN_TEXT_RE.captures_iter(xml) {
        text.push_str(&decode_entities(&cap[1]));
    }
    text
}

pub struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        vec![".docx"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| GroundedError::Extraction(format!("Not a valid DOCX archive: {}", e)))?;
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|e| GroundedError::Extraction(format!("DOCX missing document body: {}", e)))?
            .read_to_string(&mut xml)?;

        let mut blocks = Vec::new();
        let mut current_heading = String::new();
        let mut current_content: Vec<String> = Vec::new();

        // Tables are handled separately below
        let body = TABLE_RE.replace_all(&xml, "");

        let flush = |blocks: &mut Vec<TextBlock>, heading: &str, content: &mut Vec<String>| {
            let text = content.join("\n");
            let text = text.trim();
            if !text.is_empty() {
                let mut metadata = Metadata::new();
                metadata.insert("file_type".into(), Scalar::Str("docx".into()));
                metadata.insert("heading".into(), Scalar::Str(heading.to_string()));
                blocks.push(TextBlock::new(text, metadata));
            }
            content.clear();
        };

        for paragraph in PARAGRAPH_RE.find_iter(&body) {
            let xml = paragraph.as_str();
            let text = paragraph_text(xml);
            let is_heading = STYLE_RE
                .captures(xml)
                .map(|cap| cap[1].starts_with("Heading"))
                .unwrap_or(false);

            if is_heading {
                flush(&mut blocks, &current_heading, &mut current_content);
                current_heading = text.trim().to_string();
                current_content.push(text);
            } else if !text.trim().is_empty() {
                current_content.push(text);
            }
        }
        flush(&mut blocks, &current_heading, &mut current_content);

        for (i, table) in TABLE_RE.find_iter(&xml).enumerate() {
            let mut rows = Vec::new();
            for row in ROW_RE.find_iter(table.as_str()) {
                let cells: Vec<String> = CELL_RE
                    .find_iter(row.as_str())
                    .map(|cell| paragraph_text(cell.as_str()).trim().to_string())
                    .collect();
                rows.push(cells.join(" | "));
            }
            let table_text = rows.join("\n");
            if !table_text.trim().is_empty() {
                let mut metadata = Metadata::new();
                metadata.insert("file_type".into(), Scalar::Str("docx".into()));
                metadata.insert("content_type".into(), Scalar::Str("table".into()));
                metadata.insert("table_index".into(), Scalar::Int(i as i64));
                blocks.push(TextBlock::new(table_text, metadata));
            }
        }

        if blocks.is_empty() {
            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("docx".into()));
            blocks.push(TextBlock::new(
                "[No extractable text found in DOCX]",
                metadata,
            ));
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraph_text_joins_runs() {
        let xml = r#"<w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t xml:space="preserve">world &amp; beyond</w:t></w:r></w:p>"#;
        assert_eq!(paragraph_text(xml), "Hello world & beyond");
    }

    #[test]
    fn test_heading_style_detection() {
        let xml = r#"<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Title</w:t></w:r></w:p>"#;
        assert!(STYLE_RE
            .captures(xml)
            .map(|cap| cap[1].starts_with("Heading"))
            .unwrap_or(false));
    }
}
