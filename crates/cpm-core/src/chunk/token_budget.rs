//! Token-budgeted packing of logical blocks into chunks.
//!
//! The budgeter is the single place where token counting happens. Packing is
//! greedy: blocks accumulate until the target budget is hit, a tail of blocks
//! is carried forward as overlap, and any single block above the hard cap is
//! split by lines.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{ChunkingConfig, SplitStrategy};
use crate::model::DocChunk;

/// Counts tokens in a text. The default is whitespace-split length.
pub type TokenCounter = Box<dyn Fn(&str) -> usize + Send + Sync>;

fn whitespace_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.split_whitespace().count().max(1)
    }
}

/// One logical unit produced by a chunker before packing.
#[derive(Debug, Clone)]
pub struct Block {
    pub text: String,
    pub meta: BTreeMap<String, Value>,
}

impl Block {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    fn is_symbol(&self) -> bool {
        self.meta.get("kind").and_then(|v| v.as_str()) == Some("symbol")
    }
}

/// Packs blocks into chunks by token budget with overlap.
pub struct TokenBudgeter {
    counter: TokenCounter,
}

impl Default for TokenBudgeter {
    fn default() -> Self {
        Self {
            counter: Box::new(whitespace_tokens),
        }
    }
}

impl TokenBudgeter {
    pub fn with_counter(counter: TokenCounter) -> Self {
        Self { counter }
    }

    pub fn count(&self, text: &str) -> usize {
        (self.counter)(text)
    }

    /// Split a parent text into micro parts without any parsing dependency.
    pub fn split_text_micro(
        &self,
        text: &str,
        target_tokens: usize,
        overlap_tokens: usize,
        hard_cap_tokens: Option<usize>,
        strategy: SplitStrategy,
    ) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let target = match hard_cap_tokens {
            Some(cap) => target_tokens.min(cap).max(1),
            None => target_tokens.max(1),
        };
        let overlap = overlap_tokens.min(target.saturating_sub(1));

        let mut units: Vec<String> = match strategy {
            SplitStrategy::Paragraphs => text
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            SplitStrategy::Lines => Vec::new(),
        };
        if units.is_empty() {
            units = text
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.trim().is_empty())
                .map(String::from)
                .collect();
        }
        if units.is_empty() {
            units = vec![text.trim().to_string()];
        }

        let mut parts: Vec<String> = Vec::new();
        let mut buf: Vec<String> = Vec::new();
        let mut buf_tokens = 0usize;

        let flush = |buf: &mut Vec<String>, buf_tokens: &mut usize, parts: &mut Vec<String>| {
            if buf.is_empty() {
                return;
            }
            let joined = buf.join("\n").trim().to_string();
            if !joined.is_empty() {
                parts.push(joined);
            }
            if overlap == 0 {
                buf.clear();
                *buf_tokens = 0;
                return;
            }
            let mut tail: Vec<String> = Vec::new();
            let mut tail_tokens = 0usize;
            for unit in buf.iter().rev() {
                let t = self.count(unit);
                if !tail.is_empty() && tail_tokens + t > overlap {
                    break;
                }
                tail.push(unit.clone());
                tail_tokens += t;
            }
            tail.reverse();
            *buf = tail;
            *buf_tokens = tail_tokens;
        };

        for unit in units {
            let t = self.count(&unit);
            if let Some(cap) = hard_cap_tokens {
                if t > cap {
                    flush(&mut buf, &mut buf_tokens, &mut parts);
                    parts.extend(self.hard_split_lines(&unit, cap));
                    continue;
                }
            }
            if !buf.is_empty() && buf_tokens + t > target {
                flush(&mut buf, &mut buf_tokens, &mut parts);
            }
            buf_tokens += t;
            buf.push(unit);
        }
        flush(&mut buf, &mut buf_tokens, &mut parts);
        parts
    }

    fn hard_split_lines(&self, text: &str, cap: usize) -> Vec<String> {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .collect();
        let lines = if lines.is_empty() { vec![text] } else { lines };

        let mut out = Vec::new();
        let mut part: Vec<&str> = Vec::new();
        let mut part_tokens = 0usize;
        for line in lines {
            let t = self.count(line);
            if !part.is_empty() && part_tokens + t > cap {
                let joined = part.join("\n").trim().to_string();
                if !joined.is_empty() {
                    out.push(joined);
                }
                part.clear();
                part_tokens = 0;
            }
            part.push(line);
            part_tokens += t;
        }
        if !part.is_empty() {
            let joined = part.join("\n").trim().to_string();
            if !joined.is_empty() {
                out.push(joined);
            }
        }
        out
    }

    /// Pack blocks into chunks. Chunk ids are
    /// `<source_id>:<prefix>:<id_offset + ordinal>`.
    pub fn pack_blocks(
        &self,
        blocks: &[Block],
        source_id: &str,
        base_meta: &BTreeMap<String, Value>,
        config: &ChunkingConfig,
        overlap_tokens: usize,
        chunk_id_prefix: &str,
        id_offset: usize,
    ) -> Vec<DocChunk> {
        let target = match config.hard_cap_tokens {
            Some(cap) => config.chunk_tokens.min(cap).max(1),
            None => config.chunk_tokens.max(1),
        };
        let overlap = overlap_tokens.min(target.saturating_sub(1));
        let max_symbols = config.max_symbol_blocks_per_chunk.max(1);

        let mut chunks: Vec<DocChunk> = Vec::new();
        let mut buf: Vec<&Block> = Vec::new();
        let mut buf_tokens = 0usize;
        let mut buf_symbols = 0usize;

        macro_rules! emit {
            ($text:expr, $metas:expr) => {{
                let mut meta = base_meta.clone();
                meta.insert("block_count".into(), Value::from($metas.len()));
                meta.insert(
                    "blocks_meta".into(),
                    Value::Array(
                        $metas
                            .iter()
                            .map(|m: &&BTreeMap<String, Value>| {
                                Value::Object((*m).clone().into_iter().collect())
                            })
                            .collect(),
                    ),
                );
                let id = format!("{source_id}:{chunk_id_prefix}:{}", id_offset + chunks.len());
                chunks.push(DocChunk {
                    id,
                    text: $text,
                    metadata: meta,
                });
            }};
        }

        macro_rules! flush {
            () => {{
                if !buf.is_empty() {
                    let joined = buf
                        .iter()
                        .map(|b| b.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                        .trim()
                        .to_string();
                    if !joined.is_empty() {
                        let metas: Vec<&BTreeMap<String, Value>> =
                            buf.iter().map(|b| &b.meta).collect();
                        emit!(joined, metas);
                    }
                    if overlap == 0 {
                        buf.clear();
                        buf_tokens = 0;
                        buf_symbols = 0;
                    } else {
                        let mut tail: Vec<&Block> = Vec::new();
                        let mut tail_tokens = 0usize;
                        for block in buf.iter().rev() {
                            let t = self.count(&block.text);
                            if !tail.is_empty() && tail_tokens + t > overlap {
                                break;
                            }
                            tail.push(*block);
                            tail_tokens += t;
                        }
                        tail.reverse();
                        buf = tail;
                        buf_tokens = tail_tokens;
                        buf_symbols = buf.iter().filter(|b| b.is_symbol()).count();
                    }
                }
            }};
        }

        for block in blocks {
            let is_symbol = block.is_symbol();
            if is_symbol && !buf.is_empty() && buf_symbols >= max_symbols {
                flush!();
            }

            let tokens = self.count(&block.text);
            if let Some(cap) = config.hard_cap_tokens {
                if tokens > cap {
                    flush!();
                    for part in self.hard_split_lines(&block.text, cap) {
                        let mut meta = block.meta.clone();
                        meta.insert("hard_split".into(), Value::Bool(true));
                        let metas = vec![&meta];
                        emit!(part, metas);
                    }
                    buf.clear();
                    buf_tokens = 0;
                    buf_symbols = 0;
                    continue;
                }
            }

            if !buf.is_empty() && buf_tokens + tokens > target {
                flush!();
            }
            buf_tokens += tokens;
            if is_symbol {
                buf_symbols += 1;
            }
            buf.push(block);
        }
        flush!();
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("chunker".into(), Value::from("test"));
        m
    }

    #[test]
    fn packs_within_budget() {
        let budgeter = TokenBudgeter::default();
        let blocks: Vec<Block> = (0..6).map(|i| Block::new(format!("word{i} extra"))).collect();
        let mut config = ChunkingConfig::default();
        config.chunk_tokens = 4;
        let chunks = budgeter.pack_blocks(&blocks, "src", &base(), &config, 0, "test", 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].id, "src:test:0");
        assert_eq!(chunks[2].id, "src:test:2");
    }

    #[test]
    fn overlap_carries_tail() {
        let budgeter = TokenBudgeter::default();
        let blocks = vec![
            Block::new("alpha beta"),
            Block::new("gamma delta"),
            Block::new("epsilon zeta"),
        ];
        let mut config = ChunkingConfig::default();
        config.chunk_tokens = 4;
        let chunks = budgeter.pack_blocks(&blocks, "s", &base(), &config, 2, "test", 0);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].text.contains("gamma delta"));
    }

    #[test]
    fn oversized_block_hard_splits_by_lines() {
        let budgeter = TokenBudgeter::default();
        let big = (0..20)
            .map(|i| format!("line{i} token token"))
            .collect::<Vec<_>>()
            .join("\n");
        let blocks = vec![Block::new(big)];
        let mut config = ChunkingConfig::default();
        config.chunk_tokens = 100;
        config.hard_cap_tokens = Some(9);
        let chunks = budgeter.pack_blocks(&blocks, "s", &base(), &config, 0, "test", 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(budgeter.count(&chunk.text) <= 9);
            assert_eq!(
                chunk.metadata["blocks_meta"][0]["hard_split"],
                Value::Bool(true)
            );
        }
    }

    #[test]
    fn id_offset_keeps_ids_unique_across_calls() {
        let budgeter = TokenBudgeter::default();
        let blocks = vec![Block::new("one"), Block::new("two")];
        let mut config = ChunkingConfig::default();
        config.chunk_tokens = 1;
        let first = budgeter.pack_blocks(&blocks, "s", &base(), &config, 0, "p", 0);
        let second = budgeter.pack_blocks(&blocks, "s", &base(), &config, 0, "p", first.len());
        let mut ids: Vec<&str> = first.iter().chain(&second).map(|c| c.id.as_str()).collect();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn micro_split_deterministic() {
        let budgeter = TokenBudgeter::default();
        let text = "para one has words\n\npara two also has several words\n\nshort";
        let a = budgeter.split_text_micro(text, 5, 1, None, SplitStrategy::Paragraphs);
        let b = budgeter.split_text_micro(text, 5, 1, None, SplitStrategy::Paragraphs);
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
