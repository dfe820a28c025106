//! Markdown section chunker.
//!
//! Sections start at heading lines (`#`...); a leading unheaded prefix forms
//! its own section. With `include_context_in_children`, the section heading is
//! prepended to each child chunk.

use std::collections::BTreeMap;

use serde_json::Value;

use super::token_budget::{Block, TokenBudgeter};
use super::{Chunker, ChunkingConfig, SplitStrategy, LEVEL_CHILD, LEVEL_PARENT};
use crate::model::DocChunk;

fn split_sections(text: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
    let mut title = String::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with('#') {
            if !current.is_empty() {
                sections.push((title.clone(), std::mem::take(&mut current)));
            }
            title = line.trim().to_string();
            current.push(line);
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        sections.push((title, current));
    }

    sections
        .into_iter()
        .map(|(t, lines)| (t, lines.join("\n").trim().to_string()))
        .filter(|(_, body)| !body.is_empty())
        .collect()
}

/// Splits Markdown into heading-delimited sections.
#[derive(Debug, Default)]
pub struct MarkdownChunker;

impl Chunker for MarkdownChunker {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn chunk(
        &self,
        text: &str,
        source_id: &str,
        ext: &str,
        config: &ChunkingConfig,
        budgeter: &TokenBudgeter,
    ) -> Vec<DocChunk> {
        let mut sections = split_sections(text);
        if sections.is_empty() && !text.trim().is_empty() {
            sections.push((String::new(), text.trim().to_string()));
        }

        let mut blocks: Vec<Block> = Vec::new();
        for (i, (title, body)) in sections.iter().enumerate() {
            let slug: String = title.chars().take(64).collect();
            let parent_id = format!("{source_id}:md:section:{i}:{slug}");
            let parent_meta = |block: Block| {
                block
                    .with_meta("kind", Value::from("md_section"))
                    .with_meta("title", Value::from(title.as_str()))
                    .with_meta("lang", Value::from("markdown"))
                    .with_meta("level", Value::from(LEVEL_PARENT))
                    .with_meta("parent_id", Value::from(parent_id.clone()))
            };

            if config.emit_parent_chunks {
                blocks.push(parent_meta(Block::new(body.clone())));
            }

            let parts = if config.hierarchical {
                budgeter.split_text_micro(
                    body,
                    config.micro_chunk_tokens,
                    config.micro_overlap_tokens,
                    config.micro_hard_cap_tokens.or(config.hard_cap_tokens),
                    SplitStrategy::Paragraphs,
                )
            } else {
                vec![body.clone()]
            };

            for (j, part) in parts.into_iter().enumerate() {
                let text = if config.include_context_in_children
                    && !title.is_empty()
                    && !part.starts_with(title.as_str())
                {
                    format!("{title}\n\n{part}")
                } else {
                    part
                };
                blocks.push(
                    Block::new(text)
                        .with_meta("kind", Value::from("md_child"))
                        .with_meta("title", Value::from(title.as_str()))
                        .with_meta("lang", Value::from("markdown"))
                        .with_meta("level", Value::from(LEVEL_CHILD))
                        .with_meta("parent_id", Value::from(parent_id.clone()))
                        .with_meta("child_index", Value::from(j)),
                );
            }
        }

        let mut base_meta = BTreeMap::new();
        base_meta.insert("source_id".into(), Value::from(source_id));
        base_meta.insert("ext".into(), Value::from(ext));
        base_meta.insert("lang".into(), Value::from("markdown"));
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
    fn heading_starts_new_section() {
        let sections = split_sections("intro\n# One\nbody\n# Two\nmore");
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].0, "");
        assert_eq!(sections[1].0, "# One");
        assert!(sections[2].1.contains("more"));
    }

    #[test]
    fn children_carry_section_header() {
        let chunker = MarkdownChunker;
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.hierarchical = true;
        config.include_context_in_children = true;
        config.micro_chunk_tokens = 4;
        config.chunk_tokens = 64;

        let text = "# Auth\n\nlogin flow uses tokens\n\nrefresh happens hourly with rotation";
        let chunks = chunker.chunk(text, "d.md", ".md", &config, &budgeter);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.text.contains("# Auth"), "missing header: {}", chunk.text);
        }
    }

    #[test]
    fn sample_doc_chunks_once() {
        let chunker = MarkdownChunker;
        let budgeter = TokenBudgeter::default();
        let config = ChunkingConfig::default();
        let chunks = chunker.chunk(
            "Welcome\nThis is a sample project\nEnd",
            "docs/intro.md",
            ".md",
            &config,
            &budgeter,
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "docs/intro.md:markdown:0");
    }
}
