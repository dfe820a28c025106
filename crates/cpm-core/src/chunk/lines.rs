//! Line-budgeted fallback chunker.
//!
//! A sliding window of `lines_per_chunk` lines with `overlap_lines` carried
//! between windows. Used directly for unknown file types and as the fallback
//! when a structured chunker cannot parse its input.

use std::collections::BTreeMap;

use serde_json::Value;

use super::token_budget::TokenBudgeter;
use super::{Chunker, ChunkingConfig};
use crate::model::DocChunk;

/// Window the text by lines and emit one chunk per window.
pub(crate) fn chunk_by_lines(
    text: &str,
    source_id: &str,
    ext: &str,
    config: &ChunkingConfig,
    chunker_name: &str,
    reason: Option<&str>,
) -> Vec<DocChunk> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Vec::new();
    }

    let window = if config.lines_per_chunk == 0 {
        lines.len().max(1)
    } else {
        config.lines_per_chunk
    };
    let overlap = config.overlap_lines.min(window.saturating_sub(1));
    let step = (window - overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + window).min(lines.len());
        let body = lines[start..end].join("\n").trim().to_string();
        if !body.is_empty() {
            let mut metadata = BTreeMap::new();
            metadata.insert("source_id".into(), Value::from(source_id));
            metadata.insert("ext".into(), Value::from(ext));
            metadata.insert("chunker".into(), Value::from(chunker_name));
            metadata.insert("line_start".into(), Value::from(start + 1));
            metadata.insert("line_end".into(), Value::from(end));
            if let Some(reason) = reason {
                metadata.insert("reason".into(), Value::from(reason));
            }
            chunks.push(DocChunk {
                id: format!("{source_id}:{chunker_name}:{}", chunks.len()),
                text: body,
                metadata,
            });
        }
        if end == lines.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Plain line-window chunker.
#[derive(Debug, Default)]
pub struct LineChunker;

impl Chunker for LineChunker {
    fn name(&self) -> &'static str {
        "lines"
    }

    fn chunk(
        &self,
        text: &str,
        source_id: &str,
        ext: &str,
        config: &ChunkingConfig,
        _budgeter: &TokenBudgeter,
    ) -> Vec<DocChunk> {
        chunk_by_lines(text, source_id, ext, config, self.name(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_with_overlap() {
        let text = (0..10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let mut config = ChunkingConfig::default();
        config.lines_per_chunk = 4;
        config.overlap_lines = 1;
        let chunks = chunk_by_lines(&text, "f.cfg", ".cfg", &config, "lines", None);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.contains("line 3"));
        assert!(chunks[1].text.starts_with("line 3"));
        assert_eq!(chunks[0].metadata["line_start"], Value::from(1));
    }

    #[test]
    fn zero_window_takes_whole_file() {
        let mut config = ChunkingConfig::default();
        config.lines_per_chunk = 0;
        let chunks = chunk_by_lines("a\nb", "f", ".x", &config, "lines", None);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn blank_input_is_empty() {
        let config = ChunkingConfig::default();
        assert!(chunk_by_lines("\n \n", "f", ".x", &config, "lines", None).is_empty());
    }
}
