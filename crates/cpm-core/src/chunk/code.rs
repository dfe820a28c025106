//! AST-backed code chunker over tree-sitter grammars.
//!
//! Python and Java get dedicated routes with language headers (module
//! docstring + imports, package + imports + class signatures); other grammars
//! go through the same machinery under the generic `treesitter` name. When a
//! parse fails the file degrades to the line-window fallback, tagged with the
//! failure reason.

use std::collections::BTreeMap;

use serde_json::Value;
use tree_sitter::{Language, Node, Parser};

use super::lines::chunk_by_lines;
use super::token_budget::{Block, TokenBudgeter};
use super::{Chunker, ChunkingConfig, LEVEL_CHILD, LEVEL_PARENT};
use crate::model::DocChunk;

/// Grammar-backed languages the code chunker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    Python,
    Java,
    Javascript,
    Typescript,
    Tsx,
    Rust,
    Go,
}

impl Lang {
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            ".py" | ".pyw" => Some(Self::Python),
            ".java" => Some(Self::Java),
            ".js" | ".jsx" | ".mjs" | ".cjs" => Some(Self::Javascript),
            ".ts" => Some(Self::Typescript),
            ".tsx" => Some(Self::Tsx),
            ".rs" => Some(Self::Rust),
            ".go" => Some(Self::Go),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Java => "java",
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::Tsx => "tsx",
            Self::Rust => "rust",
            Self::Go => "go",
        }
    }

    fn grammar(&self) -> Language {
        match self {
            Self::Python => tree_sitter_python::language(),
            Self::Java => tree_sitter_java::language(),
            Self::Javascript => tree_sitter_javascript::language(),
            Self::Typescript => tree_sitter_typescript::language_typescript(),
            Self::Tsx => tree_sitter_typescript::language_tsx(),
            Self::Rust => tree_sitter_rust::language(),
            Self::Go => tree_sitter_go::language(),
        }
    }

    /// Node kinds emitted as symbol blocks.
    fn symbol_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["function_definition", "class_definition", "decorated_definition"],
            Self::Java => &[
                "class_declaration",
                "interface_declaration",
                "enum_declaration",
                "record_declaration",
                "method_declaration",
                "constructor_declaration",
            ],
            Self::Javascript => &["function_declaration", "class_declaration", "method_definition"],
            Self::Typescript | Self::Tsx => &[
                "function_declaration",
                "class_declaration",
                "method_definition",
                "interface_declaration",
                "enum_declaration",
                "type_alias_declaration",
            ],
            Self::Rust => &[
                "function_item",
                "impl_item",
                "struct_item",
                "enum_item",
                "trait_item",
                "mod_item",
            ],
            Self::Go => &["function_declaration", "method_declaration", "type_declaration"],
        }
    }

    /// Node kinds collected into the file header block.
    fn header_kinds(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["import_statement", "import_from_statement"],
            Self::Java => &["package_declaration", "import_declaration"],
            Self::Javascript | Self::Typescript | Self::Tsx => &["import_statement"],
            Self::Rust => &["use_declaration"],
            Self::Go => &["package_clause", "import_declaration"],
        }
    }
}

fn node_text<'a>(source: &'a str, node: Node<'_>) -> &'a str {
    source.get(node.byte_range()).unwrap_or("")
}

fn symbol_name(source: &str, node: Node<'_>) -> Option<String> {
    let name = node.child_by_field_name("name")?;
    let text = node_text(source, name).trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Language header: python docstring + imports, java package + imports +
/// class signatures, import prefix elsewhere.
fn extract_header(source: &str, root: Node<'_>, lang: Lang, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cursor = root.walk();

    if lang == Lang::Python {
        if let Some(first) = root.named_child(0) {
            if first.kind() == "expression_statement" {
                if let Some(inner) = first.named_child(0) {
                    if inner.kind() == "string" {
                        parts.push(node_text(source, first).trim().to_string());
                    }
                }
            }
        }
    }

    for child in root.children(&mut cursor) {
        if lang.header_kinds().contains(&child.kind()) {
            parts.push(node_text(source, child).trim().to_string());
        } else if lang == Lang::Java && child.kind() == "class_declaration" {
            let text = node_text(source, child);
            let signature = text.split('{').next().unwrap_or("").trim();
            if !signature.is_empty() {
                parts.push(format!("{signature} {{ ... }}"));
            }
        }
    }

    let header: String = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    header.chars().take(max_chars).collect::<String>().trim().to_string()
}

fn collect_symbols<'a>(
    source: &'a str,
    node: Node<'a>,
    lang: Lang,
    depth: usize,
    out: &mut Vec<(Node<'a>, String)>,
) {
    if depth > 4 {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if lang.symbol_kinds().contains(&child.kind()) {
            let text = node_text(source, child).trim().to_string();
            if !text.is_empty() {
                out.push((child, text));
            }
        } else {
            collect_symbols(source, child, lang, depth + 1, out);
        }
    }
}

/// Chunker over one tree-sitter grammar.
#[derive(Debug, Clone, Copy)]
pub struct CodeChunker {
    name: &'static str,
    lang: Lang,
}

impl CodeChunker {
    pub fn python() -> Self {
        Self {
            name: "python-ast",
            lang: Lang::Python,
        }
    }

    pub fn java() -> Self {
        Self {
            name: "java-ast",
            lang: Lang::Java,
        }
    }

    /// Generic route for any grammar-backed extension.
    pub fn generic(lang: Lang) -> Self {
        Self {
            name: "treesitter",
            lang,
        }
    }
}

impl Chunker for CodeChunker {
    fn name(&self) -> &'static str {
        self.name
    }

    fn chunk(
        &self,
        text: &str,
        source_id: &str,
        ext: &str,
        config: &ChunkingConfig,
        budgeter: &TokenBudgeter,
    ) -> Vec<DocChunk> {
        let mut parser = Parser::new();
        if parser.set_language(self.lang.grammar()).is_err() {
            return chunk_by_lines(text, source_id, ext, config, self.name, Some("grammar_load_failed"));
        }
        let tree = match parser.parse(text, None) {
            Some(tree) => tree,
            None => {
                return chunk_by_lines(text, source_id, ext, config, self.name, Some("parse_failed"))
            }
        };
        let root = tree.root_node();
        let lang = self.lang;

        let header = if config.include_source_preamble {
            extract_header(text, root, lang, config.max_header_chars)
        } else {
            String::new()
        };

        let mut blocks: Vec<Block> = Vec::new();
        if !header.is_empty() {
            blocks.push(
                Block::new(header.clone())
                    .with_meta("kind", Value::from("preamble"))
                    .with_meta("lang", Value::from(lang.name()))
                    .with_meta("level", Value::from(LEVEL_PARENT)),
            );
        }

        let mut symbols = Vec::new();
        collect_symbols(text, root, lang, 0, &mut symbols);

        for (node, body) in symbols {
            let line_start = node.start_position().row + 1;
            let line_end = node.end_position().row + 1;
            let symbol = symbol_name(text, node);
            let parent_id = format!(
                "{source_id}:{}:{}:{}:{line_start}-{line_end}",
                lang.name(),
                node.kind(),
                symbol.as_deref().unwrap_or("anon")
            );

            let annotate = |block: Block, kind: &str, level: &str| {
                block
                    .with_meta("kind", Value::from(kind))
                    .with_meta("node_type", Value::from(node.kind()))
                    .with_meta(
                        "symbol",
                        symbol.as_deref().map(Value::from).unwrap_or(Value::Null),
                    )
                    .with_meta("lang", Value::from(lang.name()))
                    .with_meta("line_start", Value::from(line_start))
                    .with_meta("line_end", Value::from(line_end))
                    .with_meta("level", Value::from(level))
                    .with_meta("parent_id", Value::from(parent_id.clone()))
            };

            if config.emit_parent_chunks {
                blocks.push(annotate(Block::new(body.clone()), "symbol", LEVEL_PARENT));
            }

            if config.hierarchical {
                let parts = budgeter.split_text_micro(
                    &body,
                    config.micro_chunk_tokens,
                    config.micro_overlap_tokens,
                    config.micro_hard_cap_tokens.or(config.hard_cap_tokens),
                    config.micro_split_strategy,
                );
                for (j, part) in parts.into_iter().enumerate() {
                    blocks.push(
                        annotate(Block::new(part), "symbol_child", LEVEL_CHILD)
                            .with_meta("child_index", Value::from(j)),
                    );
                }
            } else {
                blocks.push(annotate(Block::new(body), "symbol", LEVEL_CHILD));
            }
        }

        if blocks.is_empty() {
            return chunk_by_lines(text, source_id, ext, config, self.name, Some("no_symbols"));
        }

        let mut base_meta = BTreeMap::new();
        base_meta.insert("source_id".into(), Value::from(source_id));
        base_meta.insert("ext".into(), Value::from(ext));
        base_meta.insert("lang".into(), Value::from(lang.name()));
        base_meta.insert("chunker".into(), Value::from(self.name));

        let mut chunks: Vec<DocChunk> = Vec::new();
        let mut rest = &blocks[..];

        let has_preamble = blocks
            .first()
            .map(|b| b.meta.get("kind").and_then(|v| v.as_str()) == Some("preamble"))
            .unwrap_or(false);
        if config.separate_preamble_chunk && has_preamble {
            let mut preamble_meta = base_meta.clone();
            preamble_meta.insert("preamble".into(), Value::Bool(true));
            chunks.extend(budgeter.pack_blocks(
                &blocks[..1],
                source_id,
                &preamble_meta,
                config,
                0,
                self.name,
                0,
            ));
            rest = &blocks[1..];
        }

        chunks.extend(budgeter.pack_blocks(
            rest,
            source_id,
            &base_meta,
            config,
            config.overlap_tokens,
            self.name,
            chunks.len(),
        ));

        if config.include_context_in_children && !header.is_empty() {
            for chunk in chunks.iter_mut() {
                let is_child = chunk
                    .metadata
                    .get("blocks_meta")
                    .and_then(|v| v.as_array())
                    .map(|metas| {
                        metas.iter().any(|m| {
                            m.get("level").and_then(|v| v.as_str()) == Some(LEVEL_CHILD)
                        })
                    })
                    .unwrap_or(false);
                if is_child && !chunk.text.starts_with(&header) {
                    chunk.text = format!("{header}\n\n{}", chunk.text);
                }
            }
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY: &str = "\"\"\"Module doc.\"\"\"\nimport os\n\n\ndef hello():\n    return 42\n\n\nclass Greeter:\n    def greet(self):\n        return \"hi\"\n";

    #[test]
    fn python_symbols_extracted() {
        let chunker = CodeChunker::python();
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.chunk_tokens = 8;
        let chunks = chunker.chunk(PY, "m.py", ".py", &config, &budgeter);
        assert!(!chunks.is_empty());
        let all: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(all.contains("def hello"));
        assert!(all.contains("class Greeter"));
        assert!(chunks[0].id.starts_with("m.py:python-ast:"));
    }

    #[test]
    fn python_header_prepended_to_children() {
        let chunker = CodeChunker::python();
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.include_context_in_children = true;
        config.chunk_tokens = 8;
        let chunks = chunker.chunk(PY, "m.py", ".py", &config, &budgeter);
        assert!(chunks.iter().any(|c| c.text.contains("import os")));
    }

    #[test]
    fn java_signature_in_header() {
        let src = "package demo;\nimport java.util.List;\n\npublic class Box {\n    public int size() { return 1; }\n}\n";
        let chunker = CodeChunker::java();
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.include_context_in_children = true;
        let chunks = chunker.chunk(src, "Box.java", ".java", &config, &budgeter);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().any(|c| c.text.contains("package demo;")));
    }

    #[test]
    fn unparseable_input_falls_back_to_lines() {
        let chunker = CodeChunker::generic(Lang::Rust);
        let budgeter = TokenBudgeter::default();
        let config = ChunkingConfig::default();
        // Plain prose has no symbol nodes; the fallback reason is recorded.
        let chunks = chunker.chunk("just some prose\nwith two lines", "x.rs", ".rs", &config, &budgeter);
        assert!(!chunks.is_empty());
        assert_eq!(
            chunks[0].metadata.get("reason").and_then(|v| v.as_str()),
            Some("no_symbols")
        );
    }

    #[test]
    fn deterministic_across_runs() {
        let chunker = CodeChunker::python();
        let budgeter = TokenBudgeter::default();
        let mut config = ChunkingConfig::default();
        config.hierarchical = true;
        config.micro_chunk_tokens = 6;
        let a = chunker.chunk(PY, "m.py", ".py", &config, &budgeter);
        let b = chunker.chunk(PY, "m.py", ".py", &config, &budgeter);
        assert_eq!(a, b);
    }
}
