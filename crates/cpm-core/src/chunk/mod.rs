//! Text segmentation for packet builds.
//!
//! The router dispatches by file extension to a concrete chunker; every
//! chunker produces ordered `DocChunk`s with stable ids of the form
//! `<source_id>:<chunker>:<ordinal>` and line/symbol metadata where the
//! backend can provide it. For a fixed input and config the output sequence
//! is byte-identical across runs and platforms.

pub mod brace;
pub mod code;
pub mod lines;
pub mod markdown;
pub mod router;
pub mod text;
pub mod token_budget;

pub use router::ChunkerRouter;
pub use token_budget::{Block, TokenBudgeter};

use crate::model::DocChunk;

/// Metadata level tag for parent (section-size) blocks.
pub const LEVEL_PARENT: &str = "section";
/// Metadata level tag for child (micro) blocks.
pub const LEVEL_CHILD: &str = "micro";

/// Strategy used when micro-splitting a parent block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// Pack by lines; robust for code and logs.
    Lines,
    /// Pack by blank-line paragraphs, falling back to lines.
    Paragraphs,
}

/// Shared chunking configuration.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target tokens per packed chunk.
    pub chunk_tokens: usize,
    /// Token overlap carried between consecutive chunks.
    pub overlap_tokens: usize,
    /// Upper bound per chunk; typically `embedder.max_seq_length - 32`.
    pub hard_cap_tokens: Option<usize>,
    /// Emit parent-section blocks plus child micro blocks.
    pub hierarchical: bool,
    /// Include parent blocks in the packed output.
    pub emit_parent_chunks: bool,
    pub micro_chunk_tokens: usize,
    pub micro_overlap_tokens: usize,
    pub micro_hard_cap_tokens: Option<usize>,
    pub micro_split_strategy: SplitStrategy,
    /// Flush the buffer once this many symbol blocks are packed together.
    pub max_symbol_blocks_per_chunk: usize,
    /// Pack the source preamble (docstring/imports) into its own chunk.
    pub separate_preamble_chunk: bool,
    /// Collect a language-specific header block at all.
    pub include_source_preamble: bool,
    /// Prepend the header to child chunks.
    pub include_context_in_children: bool,
    pub max_header_chars: usize,
    /// Line window for the plain line-budget fallback.
    pub lines_per_chunk: usize,
    pub overlap_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: 320,
            overlap_tokens: 32,
            hard_cap_tokens: None,
            hierarchical: false,
            emit_parent_chunks: false,
            micro_chunk_tokens: 120,
            micro_overlap_tokens: 16,
            micro_hard_cap_tokens: None,
            micro_split_strategy: SplitStrategy::Lines,
            max_symbol_blocks_per_chunk: 8,
            separate_preamble_chunk: false,
            include_source_preamble: true,
            include_context_in_children: false,
            max_header_chars: 1200,
            lines_per_chunk: 80,
            overlap_lines: 10,
        }
    }
}

/// A concrete segmentation backend.
pub trait Chunker {
    fn name(&self) -> &'static str;

    fn chunk(
        &self,
        text: &str,
        source_id: &str,
        ext: &str,
        config: &ChunkingConfig,
        budgeter: &TokenBudgeter,
    ) -> Vec<DocChunk>;
}
