//! Audio transcription extraction
//!
//! Sends the file to the provider's whisper endpoint and emits one block per
//! group of timestamped segments. Registered only when a
//! transcription-capable provider is configured.

use std::path::Path;
use std::sync::Arc;

use crate::error::{GroundedError, Result};
use crate::llm::LlmRouter;
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

/// Segments per block keeps blocks around a few hundred words
const SEGMENTS_PER_BLOCK: usize = 12;

pub struct AudioExtractor {
    router: Arc<LlmRouter>,
}

impl AudioExtractor {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        Self { router }
    }
}

fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

impl Extractor for AudioExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        vec![".mp3", ".wav", ".m4a", ".ogg", ".flac"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        // The extractor seam is synchronous; bridge onto the runtime the way
        // a blocking caller would.
        let router = self.router.clone();
        let transcription = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current()
                .block_on(router.transcribe(&filename, bytes))
        })?;

        if transcription.segments.is_empty() {
            if transcription.text.trim().is_empty() {
                return Err(GroundedError::Extraction(
                    "Transcription produced no text".into(),
                ));
            }
            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("audio".into()));
            metadata.insert(
                "duration_seconds".into(),
                Scalar::Float(transcription.duration),
            );
            return Ok(vec![TextBlock::new(transcription.text, metadata)]);
        }

        let mut blocks = Vec::new();
        for group in transcription.segments.chunks(SEGMENTS_PER_BLOCK) {
            let start = group.first().map(|s| s.start).unwrap_or(0.0);
            let end = group.last().map(|s| s.end).unwrap_or(0.0);
            let text: String = group
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if text.is_empty() {
                continue;
            }

            let mut metadata = Metadata::new();
            metadata.insert("file_type".into(), Scalar::Str("audio".into()));
            metadata.insert(
                "timestamp_range".into(),
                Scalar::Str(format!(
                    "{} - {}",
                    format_timestamp(start),
                    format_timestamp(end)
                )),
            );
            metadata.insert("start_seconds".into(), Scalar::Float(start));
            blocks.push(TextBlock::new(text, metadata));
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(75.4), "00:01:15");
        assert_eq!(format_timestamp(3725.0), "01:02:05");
    }
}
