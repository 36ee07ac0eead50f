//! Plain text and Markdown extraction

use std::path::Path;

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

use crate::error::Result;
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        vec![".txt", ".md", ".markdown"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let raw = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&raw).into_owned();

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if ext == "md" || ext == "markdown" {
            return Ok(extract_markdown_sections(&content));
        }

        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), Scalar::Str("txt".into()));
        Ok(vec![TextBlock::new(content, metadata)])
    }
}

fn heading_level_to_usize(level: HeadingLevel) -> usize {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// Split Markdown into one block per heading section, tracking the heading
/// hierarchy so each block knows its place in the document.
fn extract_markdown_sections(content: &str) -> Vec<TextBlock> {
    let parser = Parser::new(content);
    let mut blocks = Vec::new();
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut current_content = String::new();
    let mut in_heading = false;
    let mut current_heading_text = String::new();
    let mut current_heading_level = 0usize;

    let flush = |blocks: &mut Vec<TextBlock>,
                 content: &mut String,
                 stack: &[(usize, String)]| {
        let text = content.trim();
        if !text.is_empty() {
            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("md".into()));
            metadata.insert(
                "section_header".into(),
                Scalar::Str(stack.last().map(|(_, t)| t.clone()).unwrap_or_default()),
            );
            metadata.insert(
                "header_path".into(),
                Scalar::Str(
                    stack
                        .iter()
                        .map(|(_, t)| t.as_str())
                        .collect::<Vec<_>>()
                        .join(" > "),
                ),
            );
            blocks.push(TextBlock::new(text, metadata));
        }
        content.clear();
    };

    for event in parser {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                flush(&mut blocks, &mut current_content, &heading_stack);
                in_heading = true;
                current_heading_text.clear();
                current_heading_level = heading_level_to_usize(level);
            }
            Event::End(TagEnd::Heading(_)) => {
                in_heading = false;
                while heading_stack
                    .last()
                    .map(|(l, _)| *l >= current_heading_level)
                    .unwrap_or(false)
                {
                    heading_stack.pop();
                }
                heading_stack.push((current_heading_level, current_heading_text.clone()));
            }
            Event::Text(text) => {
                if in_heading {
                    current_heading_text.push_str(&text);
                } else {
                    current_content.push_str(&text);
                }
            }
            Event::Code(code) => {
                if in_heading {
                    current_heading_text.push_str(&code);
                } else {
                    current_content.push('`');
                    current_content.push_str(&code);
                    current_content.push('`');
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if !in_heading {
                    current_content.push('\n');
                }
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => {
                current_content.push('\n');
            }
            _ => {}
        }
    }
    flush(&mut blocks, &mut current_content, &heading_stack);

    if blocks.is_empty() && !content.trim().is_empty() {
        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), Scalar::Str("md".into()));
        blocks.push(TextBlock::new(content.trim(), metadata));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataExt;

    #[test]
    fn test_markdown_sections_with_hierarchy() {
        let md = "# Training\n\nIntro text here.\n\n## Strength\n\nSquat guidance.\n\n## Nutrition\n\nProtein notes.\n";
        let blocks = extract_markdown_sections(md);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].metadata.section_header(), Some("Training"));
        assert_eq!(blocks[1].metadata.section_header(), Some("Strength"));
        assert_eq!(
            blocks[1].metadata.str_field("header_path"),
            Some("Training > Strength")
        );
        assert!(blocks[2].content.contains("Protein notes"));
    }

    #[test]
    fn test_preamble_without_heading() {
        let blocks = extract_markdown_sections("Just a paragraph, no headings.");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata.section_header(), Some(""));
    }
}
