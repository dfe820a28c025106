//! Retrieval pipeline: embed a query, search a packet's index, rerank,
//! compile a citation-bounded context and emit a deterministic output hash.
//!
//! Indexers and rerankers live in a per-application container rather than a
//! process-wide table; plugins add theirs through the feature registry.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::build::{EmbedOptions, Embedder, VectorDtype};
use crate::chunk::TokenBudgeter;
use crate::determinism::{hash_canonical, normalize_rel_path};
use crate::errors::CpmResult;
use crate::matrix::Matrix;
use crate::packet::index::FlatIpIndex;
use crate::packet::io::{load_manifest, read_docs_jsonl, DocRecord};
use crate::files;

pub const DEFAULT_INDEXER: &str = "faiss-flatip";
pub const DEFAULT_RERANKER: &str = "none";
pub const DEFAULT_RETRIEVER: &str = "native-retriever";
pub const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 6000;

/// One retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub score: f32,
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Index search strategy.
pub trait Indexer: Send + Sync {
    fn search(&self, index: &FlatIpIndex, query: &[f32], k: usize)
        -> CpmResult<(Vec<f32>, Vec<i64>)>;
}

/// Hit reordering strategy applied after search.
pub trait Reranker: Send + Sync {
    fn rerank(&self, query: &str, hits: Vec<Hit>, k: usize) -> Vec<Hit>;
}

/// Brute-force flat inner-product search.
pub struct FlatIpIndexer;

impl Indexer for FlatIpIndexer {
    fn search(
        &self,
        index: &FlatIpIndex,
        query: &[f32],
        k: usize,
    ) -> CpmResult<(Vec<f32>, Vec<i64>)> {
        index.search(query, k.max(1))
    }
}

/// Keeps the search order, truncated to `k`.
pub struct NoopReranker;

impl Reranker for NoopReranker {
    fn rerank(&self, _query: &str, mut hits: Vec<Hit>, k: usize) -> Vec<Hit> {
        hits.truncate(k.max(1));
        hits
    }
}

/// Prefers hits that introduce unseen tokens, then backfills by score.
pub struct TokenDiversityReranker;

impl Reranker for TokenDiversityReranker {
    fn rerank(&self, _query: &str, hits: Vec<Hit>, k: usize) -> Vec<Hit> {
        let target = k.max(1);
        let mut chosen: Vec<Hit> = Vec::new();
        let mut chosen_ids: Vec<String> = Vec::new();
        let mut seen_tokens: std::collections::HashSet<String> = std::collections::HashSet::new();

        for hit in &hits {
            let tokens: std::collections::HashSet<String> = hit
                .text
                .to_lowercase()
                .split_whitespace()
                .filter(|t| t.len() > 3)
                .map(String::from)
                .collect();
            if chosen.is_empty() {
                seen_tokens.extend(tokens);
                chosen_ids.push(hit.id.clone());
                chosen.push(hit.clone());
            } else {
                let novelty = tokens.difference(&seen_tokens).count();
                if novelty > 0 || chosen.len() < target / 2 {
                    seen_tokens.extend(tokens);
                    chosen_ids.push(hit.id.clone());
                    chosen.push(hit.clone());
                }
            }
            if chosen.len() >= target {
                break;
            }
        }
        if chosen.len() < target {
            for hit in hits {
                if chosen.len() >= target {
                    break;
                }
                if !chosen_ids.contains(&hit.id) {
                    chosen_ids.push(hit.id.clone());
                    chosen.push(hit);
                }
            }
        }
        chosen
    }
}

/// Dependency-injected lookup of indexers and rerankers.
pub struct RetrievalComponents {
    indexers: BTreeMap<String, Box<dyn Indexer>>,
    rerankers: BTreeMap<String, Box<dyn Reranker>>,
}

impl Default for RetrievalComponents {
    fn default() -> Self {
        let mut components = Self {
            indexers: BTreeMap::new(),
            rerankers: BTreeMap::new(),
        };
        components.register_indexer(DEFAULT_INDEXER, Box::new(FlatIpIndexer));
        components.register_reranker(DEFAULT_RERANKER, Box::new(NoopReranker));
        components.register_reranker("token-diversity", Box::new(TokenDiversityReranker));
        components
    }
}

impl RetrievalComponents {
    pub fn register_indexer(&mut self, name: &str, indexer: Box<dyn Indexer>) {
        self.indexers.insert(name.trim().to_string(), indexer);
    }

    pub fn register_reranker(&mut self, name: &str, reranker: Box<dyn Reranker>) {
        self.rerankers.insert(name.trim().to_string(), reranker);
    }

    pub fn indexer_names(&self) -> Vec<String> {
        self.indexers.keys().cloned().collect()
    }

    pub fn reranker_names(&self) -> Vec<String> {
        self.rerankers.keys().cloned().collect()
    }
}

/// One snippet of the compiled context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub citation: String,
    pub id: String,
    pub score: f32,
    pub text: String,
    pub token_estimate: u64,
}

/// Token-budgeted, cited subset of the retrieved snippets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledContext {
    pub token_estimate: u64,
    pub core_snippets: Vec<ContextSnippet>,
}

/// Retrieval request parameters.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    /// Display name of the packet (spec or path as given by the caller).
    pub packet: String,
    pub query: String,
    pub k: usize,
    pub indexer: String,
    pub reranker: String,
    pub selected_model: Option<String>,
    pub max_context_tokens: u64,
}

impl RetrievalRequest {
    pub fn new(packet: impl Into<String>, query: impl Into<String>, k: usize) -> Self {
        Self {
            packet: packet.into(),
            query: query.into(),
            k,
            indexer: DEFAULT_INDEXER.to_string(),
            reranker: DEFAULT_RERANKER.to_string(),
            selected_model: None,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
        }
    }
}

/// Retrieval result payload. Errors are carried in-band (`ok: false`) so
/// command surfaces can print structured failures without panicking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalPayload {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub packet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_path: Option<String>,
    pub query: String,
    pub k: usize,
    pub indexer: String,
    pub reranker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub results: Vec<Hit>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled_context: Option<CompiledContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
}

impl RetrievalPayload {
    fn skeleton(request: &RetrievalRequest) -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
            hint: None,
            packet: request.packet.clone(),
            packet_version: None,
            packet_path: None,
            query: request.query.clone(),
            k: request.k,
            indexer: request.indexer.clone(),
            reranker: request.reranker.clone(),
            selected_model: request.selected_model.clone(),
            results: Vec::new(),
            warnings: Vec::new(),
            compiled_context: None,
            output_hash: None,
        }
    }

    fn failed(request: &RetrievalRequest, error: &str, detail: impl Into<String>) -> Self {
        let mut payload = Self::skeleton(request);
        payload.ok = false;
        payload.error = Some(error.to_string());
        payload.detail = Some(detail.into());
        payload
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Citation for a hit: metadata `path`, else the id's source prefix, else a
/// synthesized positional tag. Never empty.
fn citation_for(hit: &Hit, index: usize) -> String {
    if let Some(path) = hit.metadata.get("path").and_then(|v| v.as_str()) {
        if !path.trim().is_empty() {
            return path.trim().to_string();
        }
    }
    let prefix = hit.id.split(':').next().unwrap_or("").trim().to_string();
    if !prefix.is_empty() {
        return prefix;
    }
    format!("snippet:{index}")
}

/// Greedily append snippets in score order while the cumulative token
/// estimate stays within budget.
pub fn compile_context(hits: &[Hit], max_context_tokens: u64) -> CompiledContext {
    let budgeter = TokenBudgeter::default();
    let mut snippets = Vec::new();
    let mut total: u64 = 0;
    for (i, hit) in hits.iter().enumerate() {
        let estimate = budgeter.count(&hit.text) as u64;
        if total + estimate > max_context_tokens && !snippets.is_empty() {
            break;
        }
        if total + estimate > max_context_tokens {
            continue;
        }
        total += estimate;
        snippets.push(ContextSnippet {
            citation: citation_for(hit, i),
            id: hit.id.clone(),
            score: hit.score,
            text: hit.text.clone(),
            token_estimate: estimate,
        });
    }
    CompiledContext {
        token_estimate: total,
        core_snippets: snippets,
    }
}

/// Deterministic hash over the retrieval outcome, for `replay`.
pub fn output_hash(request: &RetrievalRequest, payload: &RetrievalPayload) -> CpmResult<String> {
    hash_canonical(&json!({
        "packet": request.packet,
        "query": request.query,
        "k": request.k,
        "indexer": request.indexer,
        "reranker": request.reranker,
        "selected_model": request.selected_model,
        "results": payload.results,
        "compiled_context": payload.compiled_context,
    }))
}

/// Run a query against a resolved packet directory.
pub fn run_query(
    packet_dir: &Path,
    request: &RetrievalRequest,
    embedder: &dyn Embedder,
    components: &RetrievalComponents,
) -> RetrievalPayload {
    let Some(indexer) = components.indexers.get(request.indexer.trim()) else {
        let mut payload = RetrievalPayload::failed(
            request,
            "invalid_indexer",
            format!("indexer '{}' is not registered", request.indexer),
        );
        payload.warnings = vec![format!(
            "available indexers: {}",
            components.indexer_names().join(", ")
        )];
        return payload;
    };
    let Some(reranker) = components.rerankers.get(request.reranker.trim()) else {
        let mut payload = RetrievalPayload::failed(
            request,
            "invalid_reranker",
            format!("reranker '{}' is not registered", request.reranker),
        );
        payload.warnings = vec![format!(
            "available rerankers: {}",
            components.reranker_names().join(", ")
        )];
        return payload;
    };

    let missing = crate::packet::missing_artifacts(packet_dir);
    let missing: Vec<&str> = missing
        .into_iter()
        .filter(|rel| *rel != files::PACKET_INFO && *rel != files::LOCKFILE)
        .collect();
    if !missing.is_empty() {
        return RetrievalPayload::failed(
            request,
            "packet_not_found",
            format!(
                "packet at {} is incomplete (missing {})",
                packet_dir.display(),
                missing.join(", ")
            ),
        );
    }

    let manifest = match load_manifest(&packet_dir.join(files::MANIFEST)) {
        Ok(m) => m,
        Err(e) => return RetrievalPayload::failed(request, "invalid_manifest", e.to_string()),
    };
    let model_name = request
        .selected_model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| manifest.embedding.model.clone());
    if model_name.trim().is_empty() {
        return RetrievalPayload::failed(
            request,
            "invalid_manifest",
            "manifest.embedding.model is required",
        );
    }
    let max_seq_length = manifest.embedding.max_seq_length.unwrap_or(1024);

    let docs: Vec<DocRecord> = match read_docs_jsonl(&packet_dir.join(files::DOCS)) {
        Ok(d) => d,
        Err(e) => return RetrievalPayload::failed(request, "retrieval_failed", e.to_string()),
    };
    let index = match FlatIpIndex::load(&packet_dir.join(files::INDEX)) {
        Ok(i) => i,
        Err(e) => return RetrievalPayload::failed(request, "retrieval_failed", e.to_string()),
    };

    if !embedder.health() {
        return RetrievalPayload::failed(
            request,
            "embed_server_unreachable",
            "embedding endpoint did not answer the health probe",
        )
        .with_hint("configure an embedding provider with `cpm embed add ... --set-default`");
    }

    let options = EmbedOptions {
        model: model_name.clone(),
        max_seq_length,
        normalize: true,
        dtype: VectorDtype::Float32,
        show_progress: false,
    };
    let query_matrix: Matrix = match embedder.embed_texts(&[request.query.clone()], &options) {
        Ok(m) => m,
        Err(e) => return RetrievalPayload::failed(request, "retrieval_failed", e.to_string()),
    };
    if query_matrix.nrows() != 1 {
        return RetrievalPayload::failed(
            request,
            "retrieval_failed",
            format!("embedder returned {} rows for one query", query_matrix.nrows()),
        );
    }

    let (scores, ids) = match indexer.search(&index, query_matrix.row(0), request.k) {
        Ok(r) => r,
        Err(e) => return RetrievalPayload::failed(request, "retrieval_failed", e.to_string()),
    };

    let mut hits: Vec<Hit> = Vec::new();
    for (score, id) in scores.iter().zip(ids.iter()) {
        if *id < 0 {
            continue;
        }
        let idx = *id as usize;
        if idx >= docs.len() {
            continue;
        }
        let doc = &docs[idx];
        hits.push(Hit {
            score: *score,
            id: doc.id.clone(),
            text: doc.text.clone(),
            metadata: doc.metadata.clone(),
        });
    }

    let reranked = reranker.rerank(&request.query, hits, request.k);

    let mut payload = RetrievalPayload::skeleton(request);
    payload.selected_model = Some(model_name);
    payload.packet_path = Some(normalize_rel_path(packet_dir));
    payload.packet_version = packet_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string());

    if reranked.len() >= 2 {
        let max = reranked.iter().map(|h| h.score).fold(f32::MIN, f32::max);
        let min = reranked.iter().map(|h| h.score).fold(f32::MAX, f32::min);
        if (max - min).abs() <= 1e-6 {
            payload.warnings.push(
                "degenerate scores: all top-k similarity scores are nearly identical".to_string(),
            );
        }
    }

    payload.compiled_context = Some(compile_context(&reranked, request.max_context_tokens));
    payload.results = reranked;
    match output_hash(request, &payload) {
        Ok(hash) => payload.output_hash = Some(hash),
        Err(e) => return RetrievalPayload::failed(request, "retrieval_failed", e.to_string()),
    }
    payload
}

/// Packet diff report with semantic drift estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffReport {
    pub ok: bool,
    pub left: String,
    pub right: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub drift_score: Option<f64>,
    pub delta_ndcg_proxy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn f16_values(path: &Path) -> Option<Vec<f32>> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|p| half::f16::from_le_bytes([p[0], p[1]]).to_f32())
            .collect(),
    )
}

/// L2 drift over the shared leading prefix of two f16 vector files,
/// normalized by the shorter length.
fn embedding_drift(left: &Path, right: &Path) -> Option<f64> {
    let l = f16_values(left)?;
    let r = f16_values(right)?;
    let size = l.len().min(r.len());
    if size == 0 {
        return None;
    }
    let sum: f64 = l[..size]
        .iter()
        .zip(&r[..size])
        .map(|(a, b)| {
            let d = (*a - *b) as f64;
            d * d
        })
        .sum();
    Some(sum.sqrt() / size as f64)
}

/// Diff two packet directories.
pub fn diff_packets(left_dir: &Path, right_dir: &Path, max_drift: Option<f64>) -> CpmResult<DiffReport> {
    let read_map = |dir: &Path| -> CpmResult<BTreeMap<String, String>> {
        let records = read_docs_jsonl(&dir.join(files::DOCS))?;
        Ok(records
            .into_iter()
            .map(|r| (r.id, r.text))
            .collect())
    };
    let left_map = read_map(left_dir)?;
    let right_map = read_map(right_dir)?;

    let added: Vec<String> = right_map
        .keys()
        .filter(|k| !left_map.contains_key(*k))
        .cloned()
        .collect();
    let removed: Vec<String> = left_map
        .keys()
        .filter(|k| !right_map.contains_key(*k))
        .cloned()
        .collect();
    let changed: Vec<String> = left_map
        .iter()
        .filter(|(k, v)| right_map.get(*k).is_some_and(|rv| rv != *v))
        .map(|(k, _)| k.clone())
        .collect();

    let union: std::collections::BTreeSet<&String> =
        left_map.keys().chain(right_map.keys()).collect();
    let denominator = union.len().max(1) as f64;
    let delta_ndcg_proxy =
        ((added.len() + removed.len() + changed.len()) as f64 / denominator * 1e6).round() / 1e6;

    let drift_score = embedding_drift(
        &left_dir.join(files::VECTORS),
        &right_dir.join(files::VECTORS),
    );

    let mut report = DiffReport {
        ok: true,
        left: normalize_rel_path(left_dir),
        right: normalize_rel_path(right_dir),
        added,
        removed,
        changed,
        drift_score,
        delta_ndcg_proxy,
        error: None,
    };
    if let (Some(limit), Some(drift)) = (max_drift, drift_score) {
        if drift > limit {
            report.ok = false;
            report.error = Some("drift_threshold_exceeded".to_string());
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{build_packet, BuildRequest, BuilderConfig};
    use crate::errors::CpmResult as Result_;

    struct UnitEmbedder;

    impl Embedder for UnitEmbedder {
        fn health(&self) -> bool {
            true
        }

        fn embed_texts(&self, texts: &[String], _options: &EmbedOptions) -> Result_<Matrix> {
            let mut m = Matrix::new(4);
            for text in texts {
                // Queries about code land on axis 1, prose on axis 0.
                let axis = if text.contains("hello") || text.contains("return") {
                    1
                } else {
                    0
                };
                let mut row = vec![0.0f32; 4];
                row[axis] = 1.0;
                m.push_row(&row).unwrap();
            }
            Ok(m)
        }
    }

    struct BuildTimeEmbedder;

    impl Embedder for BuildTimeEmbedder {
        fn health(&self) -> bool {
            true
        }

        fn embed_texts(&self, texts: &[String], _options: &EmbedOptions) -> Result_<Matrix> {
            let mut m = Matrix::new(4);
            for text in texts {
                let axis = if text.contains("hello") { 1 } else { 0 };
                let mut row = vec![0.0f32; 4];
                row[axis] = 1.0;
                m.push_row(&row).unwrap();
            }
            Ok(m)
        }
    }

    fn built_packet(tmp: &Path) -> std::path::PathBuf {
        let source = tmp.join("docs");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("intro.md"), "Welcome\nThis is a sample project\nEnd").unwrap();
        std::fs::write(source.join("code.py"), "def hello():\n    return 42\n").unwrap();
        let packet = tmp.join("out");
        let request = BuildRequest {
            source_dir: source,
            packet_dir: packet.clone(),
            name: "docs".to_string(),
            description: "sample".to_string(),
            generated_at: "2024-05-01T00:00:00Z".to_string(),
            cpm_version: "0.1.0".to_string(),
        };
        build_packet(&request, &BuilderConfig::default(), &BuildTimeEmbedder).unwrap();
        packet
    }

    #[test]
    fn query_returns_ranked_hits_and_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let packet = built_packet(tmp.path());

        let request = RetrievalRequest::new("docs", "where does hello return", 2);
        let payload = run_query(&packet, &request, &UnitEmbedder, &RetrievalComponents::default());
        assert!(payload.ok, "{:?}", payload.error);
        assert!(!payload.results.is_empty());
        assert!(payload.results[0].text.contains("hello"));
        assert!(payload.output_hash.is_some());
        let context = payload.compiled_context.as_ref().unwrap();
        assert!(!context.core_snippets.is_empty());
        for snippet in &context.core_snippets {
            assert!(!snippet.citation.is_empty());
        }
    }

    #[test]
    fn output_hash_is_deterministic_and_content_sensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let packet = built_packet(tmp.path());
        let request = RetrievalRequest::new("docs", "sample project intro", 2);
        let components = RetrievalComponents::default();

        let a = run_query(&packet, &request, &UnitEmbedder, &components);
        let b = run_query(&packet, &request, &UnitEmbedder, &components);
        assert_eq!(a.output_hash, b.output_hash);

        let mut tampered = a.clone();
        tampered.results[0].text.push('!');
        let recomputed = output_hash(&request, &tampered).unwrap();
        assert_ne!(Some(recomputed), a.output_hash);
    }

    #[test]
    fn unknown_indexer_is_in_band_error() {
        let tmp = tempfile::tempdir().unwrap();
        let packet = built_packet(tmp.path());
        let mut request = RetrievalRequest::new("docs", "anything", 2);
        request.indexer = "does-not-exist".to_string();
        let payload = run_query(&packet, &request, &UnitEmbedder, &RetrievalComponents::default());
        assert!(!payload.ok);
        assert_eq!(payload.error.as_deref(), Some("invalid_indexer"));
    }

    #[test]
    fn context_respects_token_budget() {
        let hits: Vec<Hit> = (0..5)
            .map(|i| Hit {
                score: 1.0 - i as f32 * 0.1,
                id: format!("doc:{i}"),
                text: "ten words of text in every single snippet right here".to_string(),
                metadata: BTreeMap::new(),
            })
            .collect();
        let context = compile_context(&hits, 25);
        assert_eq!(context.core_snippets.len(), 2);
        assert!(context.token_estimate <= 25);
        assert_eq!(context.core_snippets[0].citation, "doc");
    }

    #[test]
    fn token_diversity_prefers_novel_hits() {
        let hits = vec![
            Hit {
                score: 0.9,
                id: "a".into(),
                text: "alpha tokens describing authentication".into(),
                metadata: BTreeMap::new(),
            },
            Hit {
                score: 0.8,
                id: "b".into(),
                text: "alpha tokens describing authentication".into(),
                metadata: BTreeMap::new(),
            },
            Hit {
                score: 0.7,
                id: "c".into(),
                text: "totally different subject matter entirely".into(),
                metadata: BTreeMap::new(),
            },
        ];
        let reranked = TokenDiversityReranker.rerank("q", hits, 2);
        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].id, "a");
        assert_eq!(reranked[1].id, "c");
    }

    #[test]
    fn diff_reports_changes_and_drift() {
        let tmp = tempfile::tempdir().unwrap();
        let left = built_packet(tmp.path());

        let tmp2 = tempfile::tempdir().unwrap();
        let right = built_packet(tmp2.path());
        // Mutate the right side's docs and vectors.
        let docs_path = right.join(files::DOCS);
        let mut records = read_docs_jsonl(&docs_path).unwrap();
        records[0].text = "Totally rewritten".to_string();
        let chunks: Vec<crate::model::DocChunk> =
            records.into_iter().map(|r| r.into_chunk()).collect();
        crate::packet::io::write_docs_jsonl(&chunks, &docs_path).unwrap();
        std::fs::write(right.join(files::VECTORS), vec![0u8; 16]).unwrap();

        let report = diff_packets(&left, &right, None).unwrap();
        assert_eq!(report.changed.len(), 1);
        assert!(report.drift_score.is_some());
        assert!(report.delta_ndcg_proxy > 0.0);

        let gated = diff_packets(&left, &right, Some(0.0)).unwrap();
        assert!(!gated.ok);
        assert_eq!(gated.error.as_deref(), Some("drift_threshold_exceeded"));
    }
}
