//! Extension-dispatched chunker router.

use super::brace::BraceChunker;
use super::code::{CodeChunker, Lang};
use super::lines::LineChunker;
use super::markdown::MarkdownChunker;
use super::text::TextChunker;
use super::token_budget::TokenBudgeter;
use super::{Chunker, ChunkingConfig};
use crate::model::DocChunk;

/// Brace-language extensions without a bundled grammar.
const BRACE_EXTS: [&str; 10] = [
    ".c", ".h", ".cpp", ".hpp", ".cc", ".cs", ".kt", ".swift", ".scala", ".php",
];

/// Routes a file to the best chunker for its extension.
pub struct ChunkerRouter {
    budgeter: TokenBudgeter,
}

impl Default for ChunkerRouter {
    fn default() -> Self {
        Self {
            budgeter: TokenBudgeter::default(),
        }
    }
}

impl ChunkerRouter {
    pub fn with_budgeter(budgeter: TokenBudgeter) -> Self {
        Self { budgeter }
    }

    pub fn budgeter(&self) -> &TokenBudgeter {
        &self.budgeter
    }

    /// Chunker name that will be picked for an extension.
    pub fn route_name(&self, ext: &str) -> &'static str {
        let e = ext.to_lowercase();
        match e.as_str() {
            ".py" | ".pyw" => "python-ast",
            ".java" => "java-ast",
            ".md" | ".markdown" => "markdown",
            ".txt" | ".rst" => "text",
            _ if Lang::from_ext(&e).is_some() => "treesitter",
            _ if BRACE_EXTS.contains(&e.as_str()) => "brace",
            _ => "lines",
        }
    }

    /// Chunk `text` with the chunker selected for `ext`.
    pub fn chunk(
        &self,
        text: &str,
        source_id: &str,
        ext: &str,
        config: &ChunkingConfig,
    ) -> Vec<DocChunk> {
        let e = ext.to_lowercase();
        let run = |c: &dyn Chunker| c.chunk(text, source_id, &e, config, &self.budgeter);
        match self.route_name(&e) {
            "python-ast" => run(&CodeChunker::python()),
            "java-ast" => run(&CodeChunker::java()),
            "markdown" => run(&MarkdownChunker),
            "text" => run(&TextChunker),
            "treesitter" => match Lang::from_ext(&e) {
                Some(lang) => run(&CodeChunker::generic(lang)),
                None => run(&LineChunker),
            },
            "brace" => run(&BraceChunker),
            _ => run(&LineChunker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table() {
        let router = ChunkerRouter::default();
        assert_eq!(router.route_name(".py"), "python-ast");
        assert_eq!(router.route_name(".JAVA"), "java-ast");
        assert_eq!(router.route_name(".md"), "markdown");
        assert_eq!(router.route_name(".rst"), "text");
        assert_eq!(router.route_name(".rs"), "treesitter");
        assert_eq!(router.route_name(".cpp"), "brace");
        assert_eq!(router.route_name(".cfg"), "lines");
    }

    #[test]
    fn chunker_tag_matches_route() {
        let router = ChunkerRouter::default();
        let config = ChunkingConfig::default();
        let chunks = router.chunk("# T\nbody", "a.md", ".md", &config);
        assert_eq!(chunks[0].meta_str("chunker"), Some("markdown"));

        let chunks = router.chunk("def f():\n    pass\n", "a.py", ".py", &config);
        assert_eq!(chunks[0].meta_str("chunker"), Some("python-ast"));
    }

    #[test]
    fn router_is_deterministic_over_fixture_corpus() {
        let router = ChunkerRouter::default();
        let mut config = ChunkingConfig::default();
        config.hierarchical = true;
        config.chunk_tokens = 12;
        let corpus: [(&str, &str); 4] = [
            ("# A\n\ntext one\n\ntext two", ".md"),
            ("def f():\n    return 1\n\nclass C:\n    pass\n", ".py"),
            ("fn main() { println!(\"hi\"); }", ".rs"),
            ("plain words only\n\nmore words", ".txt"),
        ];
        for (text, ext) in corpus {
            let a = router.chunk(text, "fixture", ext, &config);
            let b = router.chunk(text, "fixture", ext, &config);
            assert_eq!(a, b, "non-deterministic for {ext}");
        }
    }
}
