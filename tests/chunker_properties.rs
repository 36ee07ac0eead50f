//! Property tests for the chunker
//!
//! Run with: cargo test --test chunker_properties

use proptest::prelude::*;

use grounded::ingest::{Chunker, MIN_CHUNK_CHARS};
use grounded::types::Metadata;

const CHUNK_SIZE: usize = 200;
const OVERLAP: usize = 50;

/// Project text onto its alphanumeric characters. Separator splitting and
/// overlap joining only ever add or remove whitespace and sentence
/// punctuation, so this projection is stable across chunking.
fn alnum(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Paragraphs of globally unique words, so every chunk projection occurs at
/// exactly one position in the input projection.
fn document_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(proptest::collection::vec("[a-z]{3,8}", 12..30), 1..12).prop_map(
        |paragraphs| {
            let mut counter = 0usize;
            paragraphs
                .iter()
                .map(|words| {
                    let tagged: Vec<String> = words
                        .iter()
                        .map(|word| {
                            counter += 1;
                            format!("{}{}", word, counter)
                        })
                        .collect();
                    format!("{}.", tagged.join(" "))
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Chunking never reorders or fabricates content: every chunk is a
    /// contiguous span of the input (modulo whitespace and punctuation).
    #[test]
    fn chunks_are_contiguous_spans(text in document_strategy()) {
        let chunker = Chunker::new(CHUNK_SIZE, OVERLAP);
        let original = alnum(&text);
        for chunk in chunker.chunk(&text, &Metadata::new()) {
            let projected = alnum(&chunk.content);
            prop_assert!(
                original.contains(&projected),
                "chunk is not a contiguous span of the input"
            );
        }
    }

    /// Chunks in order, with overlaps removed, cover the input modulo the
    /// discarded below-minimum tail: each chunk starts at or before the end
    /// of covered text (a dropped middle piece rides along inside the next
    /// chunk's overlap), and any uncovered tail is smaller than the minimum
    /// chunk size.
    #[test]
    fn chunks_cover_the_input(text in document_strategy()) {
        let chunker = Chunker::new(CHUNK_SIZE, OVERLAP);
        let chunks = chunker.chunk(&text, &Metadata::new());
        prop_assume!(!chunks.is_empty());

        let original = alnum(&text);
        let mut covered_end = 0usize;
        for chunk in &chunks {
            let projected = alnum(&chunk.content);
            let start = original.find(&projected).expect("span exists");
            prop_assert!(
                start <= covered_end,
                "gap before chunk starting at {}, covered up to {}",
                start,
                covered_end
            );
            covered_end = covered_end.max(start + projected.len());
        }
        prop_assert!(
            original.len() - covered_end < MIN_CHUNK_CHARS,
            "uncovered tail of {} chars exceeds the below-minimum allowance",
            original.len() - covered_end
        );
    }

    /// Every emitted chunk respects the minimum size and the size bound:
    /// at most chunk_size plus the carried overlap and its joining space.
    #[test]
    fn chunk_sizes_are_bounded(text in document_strategy()) {
        let chunker = Chunker::new(CHUNK_SIZE, OVERLAP);
        for chunk in chunker.chunk(&text, &Metadata::new()) {
            let len = chunk.content.chars().count();
            prop_assert!(len >= MIN_CHUNK_CHARS);
            prop_assert!(
                len <= CHUNK_SIZE + OVERLAP + 1,
                "chunk of {} chars exceeds size + overlap",
                len
            );
        }
    }

    /// chunk_index values are contiguous from zero.
    #[test]
    fn chunk_indices_contiguous(text in document_strategy()) {
        use grounded::types::MetadataExt;
        let chunker = Chunker::new(CHUNK_SIZE, OVERLAP);
        for (i, chunk) in chunker.chunk(&text, &Metadata::new()).iter().enumerate() {
            prop_assert_eq!(chunk.metadata.chunk_index(), Some(i as i64));
        }
    }
}
