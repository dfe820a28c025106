//! Brace-fallback chunker for curly-brace languages without a grammar.
//!
//! Lines are grouped into top-level blocks by tracking `{`/`}` depth; each
//! balanced block (plus any preceding prefix lines) becomes one packable
//! block. String and comment awareness is intentionally out of scope - this
//! is the coarse fallback, not a parser.

use std::collections::BTreeMap;

use serde_json::Value;

use super::token_budget::{Block, TokenBudgeter};
use super::{Chunker, ChunkingConfig, LEVEL_CHILD};
use crate::model::DocChunk;

fn brace_blocks(text: &str) -> Vec<(String, usize, usize)> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut depth: i64 = 0;
    let mut start_line = 1usize;

    for (i, line) in text.lines().enumerate() {
        if current.is_empty() {
            start_line = i + 1;
        }
        current.push(line);
        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        let opened = current.iter().any(|l| l.contains('{'));
        if depth <= 0 && opened {
            let body = current.join("\n").trim().to_string();
            if !body.is_empty() {
                blocks.push((body, start_line, i + 1));
            }
            current.clear();
            depth = 0;
        }
    }
    if !current.is_empty() {
        let body = current.join("\n").trim().to_string();
        if !body.is_empty() {
            let end = text.lines().count();
            blocks.push((body, start_line, end));
        }
    }
    blocks
}

/// Groups balanced `{}` regions into blocks and packs them.
#[derive(Debug, Default)]
pub struct BraceChunker;

impl Chunker for BraceChunker {
    fn name(&self) -> &'static str {
        "brace"
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
        for (i, (body, line_start, line_end)) in brace_blocks(text).into_iter().enumerate() {
            blocks.push(
                Block::new(body)
                    .with_meta("kind", Value::from("brace_block"))
                    .with_meta("level", Value::from(LEVEL_CHILD))
                    .with_meta("block_index", Value::from(i))
                    .with_meta("line_start", Value::from(line_start))
                    .with_meta("line_end", Value::from(line_end)),
            );
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
    fn groups_balanced_blocks() {
        let src = "int add(int a, int b) {\n  return a + b;\n}\n\nint sub(int a, int b) {\n  return a - b;\n}";
        let blocks = brace_blocks(src);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].0.contains("add"));
        assert!(blocks[1].0.contains("sub"));
        assert_eq!(blocks[0].1, 1);
    }

    #[test]
    fn trailing_prefix_becomes_block() {
        let blocks = brace_blocks("void f() {\n}\n// tail comment");
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].0.contains("tail"));
    }

    #[test]
    fn chunker_emits_ids_with_prefix() {
        let chunker = BraceChunker;
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.chunk_tokens = 4;
        let chunks = chunker.chunk(
            "struct A { int x; };\nstruct B { int y; };",
            "s.h",
            ".h",
            &config,
            &budgeter,
        );
        assert!(!chunks.is_empty());
        assert!(chunks[0].id.starts_with("s.h:brace:"));
    }
}
