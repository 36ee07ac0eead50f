//! Text chunking
//!
//! Recursive separator descent: split by the strongest separator, re-split
//! oversized pieces with the next one, hard-split at the size limit when all
//! separators are exhausted. Pieces are then greedily merged; consecutive
//! chunks overlap, and the overlap starts at a sentence boundary whenever
//! the text offers one.
//!
//! Sizes are measured in characters, not bytes, so multi-byte text chunks
//! the same as ASCII.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{char_prefix, Chunk, Metadata, Scalar};

/// Chunks below this many characters are dropped as noise (page numbers,
/// stray headers).
pub const MIN_CHUNK_CHARS: usize = 50;

static PAGE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!-- PAGE (\d+) -->").expect("valid regex"));

/// Marker inserted by the PDF extractor between page texts
pub fn page_marker(page: usize) -> String {
    format!("<!-- PAGE {} -->", page)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`
fn char_suffix(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if len <= n {
        return s;
    }
    let skip = len - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    separators: Vec<&'static str>,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(1000, 200)
    }
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            separators: vec!["\n\n", "\n", ". ", " "],
        }
    }

    /// Format-appropriate chunker. Prose 1000/200; code is kept in larger
    /// pieces split only on line boundaries; tabular rows get a small
    /// overlap so header context repeats.
    pub fn for_file_type(file_type: &str, default_size: usize, default_overlap: usize) -> Self {
        match file_type {
            "code" => Self {
                chunk_size: 1500,
                chunk_overlap: 300,
                separators: vec!["\n\n", "\n"],
            },
            "csv" | "xlsx" | "xls" => Self::new(1200, 100),
            _ => Self::new(default_size, default_overlap),
        }
    }

    /// Chunk `text`, attaching `base_metadata` plus chunk_index/char_count
    pub fn chunk(&self, text: &str, base_metadata: &Metadata) -> Vec<Chunk> {
        let pieces = self.split_recursive(text, &self.separators);
        let merged = self.merge_with_overlap(&pieces);

        let mut chunks = Vec::new();
        for content in merged {
            let trimmed = content.trim();
            if trimmed.is_empty() || char_len(trimmed) < MIN_CHUNK_CHARS {
                continue;
            }
            let mut metadata = base_metadata.clone();
            metadata.insert("chunk_index".into(), Scalar::Int(chunks.len() as i64));
            metadata.insert("char_count".into(), Scalar::Int(char_len(trimmed) as i64));
            chunks.push(Chunk {
                content: trimmed.to_string(),
                metadata,
            });
        }
        chunks
    }

    fn split_recursive(&self, text: &str, separators: &[&'static str]) -> Vec<String> {
        let Some((sep, remaining)) = separators.split_first() else {
            return vec![text.to_string()];
        };

        let mut result = Vec::new();
        for part in text.split(sep) {
            if char_len(part) <= self.chunk_size {
                result.push(part.to_string());
            } else if !remaining.is_empty() {
                result.extend(self.split_recursive(part, remaining));
            } else {
                // All separators exhausted: hard-split at the size limit
                let mut rest = part;
                while char_len(rest) > self.chunk_size {
                    let cut = rest
                        .char_indices()
                        .nth(self.chunk_size)
                        .map(|(idx, _)| idx)
                        .unwrap_or(rest.len());
                    result.push(rest[..cut].to_string());
                    rest = &rest[cut..];
                }
                result.push(rest.to_string());
            }
        }
        result
    }

    fn merge_with_overlap(&self, pieces: &[String]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        for piece in pieces {
            if char_len(&current) + char_len(piece) <= self.chunk_size {
                if current.is_empty() {
                    current = piece.clone();
                } else {
                    current = format!("{} {}", current, piece).trim().to_string();
                }
            } else if current.is_empty() {
                current = piece.clone();
            } else {
                let overlap = self.sentence_aware_overlap(&current);
                chunks.push(std::mem::take(&mut current));
                current = format!("{} {}", overlap, piece).trim().to_string();
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Overlap that starts at a sentence boundary when one exists within the
    /// overlap zone, so the next chunk never begins mid-word. Falls back to a
    /// newline split, then to the raw character overlap.
    fn sentence_aware_overlap(&self, text: &str) -> String {
        if char_len(text) <= self.chunk_overlap {
            return text.to_string();
        }

        let zone = char_suffix(text, self.chunk_overlap);
        let zone_len = char_len(zone);
        let chars: Vec<(usize, char)> = zone.char_indices().collect();

        // Last ". " / "! " / "? " in the zone, keeping as many whole
        // sentences as possible
        let mut best: Option<(usize, usize)> = None; // (char pos after boundary, byte pos)
        for window in chars.windows(2) {
            let (_, punct) = window[0];
            let (next_byte, next_char) = window[1];
            if ".!?".contains(punct) && (next_char == ' ' || next_char == '\n' || next_char == '\t')
            {
                let after_byte = next_byte + next_char.len_utf8();
                let char_pos = zone[..after_byte].chars().count();
                best = Some((char_pos, after_byte));
            }
        }
        if let Some((char_pos, byte_pos)) = best {
            if char_pos > 0 && char_pos < zone_len.saturating_sub(10) {
                return zone[byte_pos..].trim().to_string();
            }
        }

        // Fallback: split on the first newline
        if let Some(nl_byte) = zone.find('\n') {
            let nl_char = zone[..nl_byte].chars().count();
            if nl_char > 0 && nl_char < zone_len.saturating_sub(10) {
                return zone[nl_byte + 1..].trim().to_string();
            }
        }

        zone.trim().to_string()
    }
}

/// Resolve the page number of each chunk of a marker-annotated PDF text.
///
/// The extractor inserts `<!-- PAGE N -->` between page texts. Each chunk is
/// located in the original text (80-character prefix first, then a
/// 40-character fallback) and labeled with the nearest preceding marker.
/// Markers are stripped from the stored content; chunks that fall below the
/// minimum size after stripping are dropped.
pub fn assign_page_numbers(chunks: Vec<Chunk>, full_text: &str) -> Vec<Chunk> {
    let markers: Vec<(usize, i64)> = PAGE_MARKER_RE
        .captures_iter(full_text)
        .filter_map(|cap| {
            let m = cap.get(0)?;
            let page = cap.get(1)?.as_str().parse().ok()?;
            Some((m.start(), page))
        })
        .collect();

    let mut result = Vec::new();
    for mut chunk in chunks {
        let position = full_text
            .find(char_prefix(&chunk.content, 80))
            .or_else(|| full_text.find(char_prefix(&chunk.content, 40)));

        if let Some(pos) = position {
            let page = markers
                .iter()
                .take_while(|(marker_pos, _)| *marker_pos <= pos)
                .last()
                .map(|(_, page)| *page);
            if let Some(page) = page {
                chunk.metadata.insert("page_number".into(), Scalar::Int(page));
            }
        }

        let cleaned = PAGE_MARKER_RE.replace_all(&chunk.content, "");
        let cleaned = cleaned.trim();
        if char_len(cleaned) < MIN_CHUNK_CHARS {
            continue;
        }
        chunk.content = cleaned.to_string();
        result.push(chunk);
    }

    // Re-number after any drops so indices stay contiguous
    for (i, chunk) in result.iter_mut().enumerate() {
        chunk.metadata.insert("chunk_index".into(), Scalar::Int(i as i64));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetadataExt;

    fn sentences(n: usize) -> String {
        (0..n)
            .map(|i| format!("This is sentence number {} with a bit of padding text.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = Chunker::default();
        let text = "A single paragraph that easily fits into one chunk and is long enough.";
        let chunks = chunker.chunk(text, &Metadata::new());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, text);
        assert_eq!(chunks[0].metadata.chunk_index(), Some(0));
    }

    #[test]
    fn test_noise_chunks_dropped() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk("42", &Metadata::new());
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_chunks_respect_size_and_overlap() {
        let chunker = Chunker::new(200, 50);
        let text = sentences(30);
        let chunks = chunker.chunk(&text, &Metadata::new());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.chars().count() <= 200 + 50);
        }
        // Overlap begins at a sentence start, not mid-word
        for pair in chunks.windows(2) {
            assert!(
                pair[1].content.starts_with("This is sentence"),
                "overlap started mid-sentence: {:?}",
                &pair[1].content[..40.min(pair[1].content.len())]
            );
        }
    }

    #[test]
    fn test_hard_split_without_separators() {
        let chunker = Chunker::new(100, 20);
        let text = "x".repeat(350);
        let chunks = chunker.chunk(&text, &Metadata::new());
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.content.chars().count() <= 120);
        }
    }

    #[test]
    fn test_multibyte_safe() {
        let chunker = Chunker::new(80, 20);
        let text = "Überraschung für alle Läufer. ".repeat(20);
        // Must not panic on char boundaries
        let chunks = chunker.chunk(&text, &Metadata::new());
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_code_chunker_parameters() {
        let chunker = Chunker::for_file_type("code", 1000, 200);
        assert_eq!(chunker.chunk_size, 1500);
        assert_eq!(chunker.chunk_overlap, 300);
        let tabular = Chunker::for_file_type("csv", 1000, 200);
        assert_eq!(tabular.chunk_size, 1200);
    }

    #[test]
    fn test_page_assignment_and_marker_stripping() {
        let page1 = sentences(8);
        let page2 = sentences(8).replace("sentence", "statement");
        let full_text = format!(
            "{}\n\n{}\n\n{}\n\n{}",
            page_marker(1),
            page1,
            page_marker(2),
            page2
        );
        let chunker = Chunker::new(300, 60);
        let chunks = chunker.chunk(&full_text, &Metadata::new());
        let chunks = assign_page_numbers(chunks, &full_text);

        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(!chunk.content.contains("<!-- PAGE"));
        }
        assert_eq!(chunks[0].metadata.page_number(), Some(1));
        let last = chunks.last().unwrap();
        assert_eq!(last.metadata.page_number(), Some(2));
        // Indices contiguous from zero
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.chunk_index(), Some(i as i64));
        }
    }
}
