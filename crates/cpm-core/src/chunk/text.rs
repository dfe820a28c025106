//! Plain-text paragraph chunker.

use std::collections::BTreeMap;

use serde_json::Value;

use super::token_budget::{Block, TokenBudgeter};
use super::{Chunker, ChunkingConfig, SplitStrategy, LEVEL_CHILD, LEVEL_PARENT};
use crate::model::DocChunk;

fn split_paragraphs(text: &str) -> Vec<String> {
    let paras: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if !paras.is_empty() {
        return paras;
    }
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Splits prose on blank-line paragraphs and packs them by token budget.
#[derive(Debug, Default)]
pub struct TextChunker;

impl Chunker for TextChunker {
    fn name(&self) -> &'static str {
        "text"
    }

    fn chunk(
        &self,
        text: &str,
        source_id: &str,
        ext: &str,
        config: &ChunkingConfig,
        budgeter: &TokenBudgeter,
    ) -> Vec<DocChunk> {
        let mut blocks: Vec<Block> = Vec::new();

        for (i, para) in split_paragraphs(text).into_iter().enumerate() {
            let parent_id = format!("{source_id}:text:para:{i}");
            let parent = Block::new(para.clone())
                .with_meta("kind", Value::from("paragraph"))
                .with_meta("level", Value::from(LEVEL_PARENT))
                .with_meta("parent_id", Value::from(parent_id.clone()));

            if config.emit_parent_chunks {
                blocks.push(parent.clone());
            }

            let micro = if config.hierarchical {
                budgeter.split_text_micro(
                    &para,
                    config.micro_chunk_tokens,
                    config.micro_overlap_tokens,
                    config.micro_hard_cap_tokens.or(config.hard_cap_tokens),
                    SplitStrategy::Paragraphs,
                )
            } else {
                vec![para]
            };

            for (j, part) in micro.into_iter().enumerate() {
                blocks.push(
                    Block::new(part)
                        .with_meta("kind", Value::from("paragraph_child"))
                        .with_meta("level", Value::from(LEVEL_CHILD))
                        .with_meta("parent_id", Value::from(parent_id.clone()))
                        .with_meta("child_index", Value::from(j)),
                );
            }
        }

        if blocks.is_empty() && !text.trim().is_empty() {
            blocks.push(
                Block::new(text.trim())
                    .with_meta("kind", Value::from("raw"))
                    .with_meta("level", Value::from(LEVEL_CHILD)),
            );
        }

        let mut base_meta = BTreeMap::new();
        base_meta.insert("source_id".into(), Value::from(source_id));
        base_meta.insert("ext".into(), Value::from(ext));
        base_meta.insert("chunker".into(), Value::from(self.name()));

        budgeter.pack_blocks(
            &blocks,
            source_id,
            &base_meta,
            config,
            config.overlap_tokens,
            self.name(),
            0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_become_chunks() {
        let chunker = TextChunker;
        let budgeter = TokenBudgeter::default();
        let config = ChunkingConfig::default();
        let chunks = chunker.chunk("one two\n\nthree four", "doc.txt", ".txt", &config, &budgeter);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].id.starts_with("doc.txt:text:"));
        assert_eq!(chunks[0].meta_str("chunker"), Some("text"));
    }

    #[test]
    fn empty_input_yields_nothing() {
        let chunker = TextChunker;
        let budgeter = TokenBudgeter::default();
        let config = ChunkingConfig::default();
        assert!(chunker.chunk("  \n ", "d", ".txt", &config, &budgeter).is_empty());
    }

    #[test]
    fn deterministic_output() {
        let chunker = TextChunker;
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.hierarchical = true;
        config.chunk_tokens = 6;
        let text = "alpha beta gamma\n\ndelta epsilon\n\nzeta eta theta iota";
        let a = chunker.chunk(text, "d", ".txt", &config, &budgeter);
        let b = chunker.chunk(text, "d", ".txt", &config, &budgeter);
        assert_eq!(a, b);
    }
}
