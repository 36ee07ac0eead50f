//! CSV extraction
//!
//! Rows are grouped into blocks of 20, each carrying the column header line
//! so every block is self-describing, plus a `row_range` for provenance.

use std::path::Path;

use crate::error::{GroundedError, Result};
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

const ROWS_PER_BLOCK: usize = 20;

/// Minimal CSV reader: comma-separated, double-quote quoting with "" escapes
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

pub struct SpreadsheetExtractor;

impl Extractor for SpreadsheetExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        vec![".csv"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let raw = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&raw);
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());

        let Some(header_line) = lines.next() else {
            return Err(GroundedError::Extraction("Empty spreadsheet".into()));
        };
        let columns = parse_csv_line(header_line);
        let column_header = columns.join(" | ");
        let rows: Vec<Vec<String>> = lines.map(parse_csv_line).collect();
        let total_rows = rows.len();

        let mut blocks = Vec::new();
        for (block_index, group) in rows.chunks(ROWS_PER_BLOCK).enumerate() {
            let start = block_index * ROWS_PER_BLOCK;
            let end = start + group.len();

            let rows_text: Vec<String> = group
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .zip(row.iter().chain(std::iter::repeat(&String::new())))
                        .map(|(col, val)| format!("{}: {}", col, val))
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .collect();

            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("csv".into()));
            metadata.insert(
                "row_range".into(),
                Scalar::Str(format!("{}-{}", start + 1, end)),
            );
            metadata.insert("total_rows".into(), Scalar::Int(total_rows as i64));
            metadata.insert("columns".into(), Scalar::Str(columns.join(", ")));

            blocks.push(TextBlock::new(
                format!("Columns: {}\n\n{}", column_header, rows_text.join("\n")),
                metadata,
            ));
        }

        if blocks.is_empty() {
            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("csv".into()));
            blocks.push(TextBlock::new("[Empty spreadsheet]", metadata));
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataExt;

    #[test]
    fn test_parse_csv_line_quoted() {
        assert_eq!(parse_csv_line("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(
            parse_csv_line(r#""hello, world",2,"say ""hi""""#),
            vec!["hello, world", "2", r#"say "hi""#]
        );
    }

    #[test]
    fn test_blocks_carry_row_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut content = String::from("name,reps\n");
        for i in 0..45 {
            content.push_str(&format!("exercise-{},{}\n", i, i % 12));
        }
        std::fs::write(&path, content).unwrap();

        let blocks = SpreadsheetExtractor.extract(&path).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].metadata.str_field("row_range"), Some("1-20"));
        assert_eq!(blocks[2].metadata.str_field("row_range"), Some("41-45"));
        assert!(blocks[0].content.starts_with("Columns: name | reps"));
        assert!(blocks[1].content.contains("name: exercise-20"));
    }
}
