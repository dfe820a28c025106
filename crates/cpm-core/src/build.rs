//! Packet build pipeline.
//!
//! Orchestrates scan -> chunk -> embed (with sha256-keyed reuse) -> index ->
//! manifest -> lockfile -> optional archive. The core stays transport-free:
//! callers inject an [`Embedder`] and the build timestamp.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::chunk::{ChunkerRouter, ChunkingConfig};
use crate::determinism::normalize_rel_path;
use crate::errors::{CpmError, CpmResult};
use crate::lockfile::{
    artifact_hashes, build_resolved_plan, load_lock, render_lock, verify_lock_against_plan,
    write_lock, PlanParams, ResolvedPlan,
};
use crate::matrix::Matrix;
use crate::model::{DocChunk, EmbeddingSpec, PacketInfo, PacketManifest};
use crate::packet::index::{FlatIpIndex, INDEX_TYPE};
use crate::packet::io::{
    compute_checksums, load_manifest, read_docs_jsonl, read_vectors_f16, write_docs_jsonl,
    write_manifest, write_packet_info, write_vectors_f16,
};
use crate::{files, MANIFEST_SCHEMA_VERSION};

/// File extensions accepted as code sources.
pub const CODE_EXTS: [&str; 12] = [
    ".py", ".js", ".ts", ".tsx", ".java", ".kt", ".go", ".rs", ".cpp", ".c", ".h", ".cs",
];
/// File extensions accepted as text sources.
pub const TEXT_EXTS: [&str; 3] = [".md", ".txt", ".rst"];

/// Vector value encoding requested from an embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorDtype {
    Float32,
    Float16,
}

impl VectorDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
        }
    }
}

/// Options for one embedding call.
#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub model: String,
    pub max_seq_length: u32,
    pub normalize: bool,
    pub dtype: VectorDtype,
    pub show_progress: bool,
}

/// Minimal embedding interface required by the builder and retriever.
pub trait Embedder {
    /// Cheap reachability probe.
    fn health(&self) -> bool;

    /// Embed texts, returning one row per input in input order.
    fn embed_texts(&self, texts: &[String], options: &EmbedOptions) -> CpmResult<Matrix>;
}

/// Archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn parse(s: &str) -> CpmResult<Self> {
        match s {
            "tar.gz" => Ok(Self::TarGz),
            "zip" => Ok(Self::Zip),
            other => Err(CpmError::invalid_config(format!(
                "unsupported archive format: {other}"
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Zip => "zip",
        }
    }
}

/// Builder configuration (`[embedding]` + `[chunking]` + `[output]`).
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub model_name: String,
    pub max_seq_length: u32,
    pub chunking: ChunkingConfig,
    pub version: String,
    pub archive: bool,
    pub archive_format: ArchiveFormat,
    pub embed_url: String,
    pub build_profile: String,
    pub update_lock: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            model_name: "jinaai/jina-embeddings-v2-base-code".to_string(),
            max_seq_length: 1024,
            chunking: ChunkingConfig::default(),
            version: "0.0.0".to_string(),
            archive: false,
            archive_format: ArchiveFormat::TarGz,
            embed_url: "http://127.0.0.1:8876".to_string(),
            build_profile: "default".to_string(),
            update_lock: false,
        }
    }
}

/// Build request: where to read, where to write, what to call the packet.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub source_dir: PathBuf,
    pub packet_dir: PathBuf,
    pub name: String,
    pub description: String,
    /// RFC3339 UTC timestamp injected by the caller.
    pub generated_at: String,
    pub cpm_version: String,
}

/// Build outcome for reporting.
#[derive(Debug)]
pub struct BuildReport {
    pub manifest: PacketManifest,
    pub chunk_count: usize,
    pub reused: usize,
    pub embedded: usize,
    pub removed: usize,
    pub archive_path: Option<PathBuf>,
}

fn accepted_ext(ext: &str) -> bool {
    CODE_EXTS.contains(&ext) || TEXT_EXTS.contains(&ext)
}

fn file_ext(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
}

/// Scan a source tree and chunk every accepted file.
pub fn scan_source(
    source_dir: &Path,
    chunking: &ChunkingConfig,
) -> CpmResult<(Vec<DocChunk>, BTreeMap<String, u64>, usize)> {
    let router = ChunkerRouter::default();
    let mut chunks: Vec<DocChunk> = Vec::new();
    let mut ext_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut files_indexed = 0usize;

    for entry in walkdir::WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| CpmError::io(format!("scan {}: {e}", source_dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(ext) = file_ext(entry.path()) else {
            continue;
        };
        if !accepted_ext(&ext) {
            continue;
        }
        files_indexed += 1;
        let raw = std::fs::read(entry.path())?;
        let text = String::from_utf8_lossy(&raw);
        if text.trim().is_empty() {
            continue;
        }
        let rel = normalize_rel_path(
            entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| CpmError::invariant(format!("scan escaped root: {e}")))?,
        );
        *ext_counts.entry(ext.clone()).or_insert(0) += 1;

        for mut chunk in router.chunk(&text, &rel, &ext, chunking) {
            chunk
                .metadata
                .insert("path".to_string(), Value::from(rel.as_str()));
            chunk
                .metadata
                .insert("ext".to_string(), Value::from(ext.as_str()));
            chunks.push(chunk);
        }
    }
    Ok((chunks, ext_counts, files_indexed))
}

fn infer_tags(ext_counts: &BTreeMap<String, u64>) -> Vec<String> {
    let has = |ext: &str| ext_counts.get(ext).copied().unwrap_or(0) > 0;
    let mut tags: Vec<&str> = Vec::new();
    if has(".py") {
        tags.push("python");
    }
    if has(".js") {
        tags.push("javascript");
    }
    if has(".ts") || has(".tsx") {
        tags.push("typescript");
    }
    if has(".java") {
        tags.push("java");
    }
    if has(".kt") {
        tags.push("kotlin");
    }
    if has(".go") {
        tags.push("go");
    }
    if has(".rs") {
        tags.push("rust");
    }
    if has(".cpp") || has(".c") || has(".h") {
        tags.push("cpp");
    }
    if has(".cs") {
        tags.push("csharp");
    }
    if has(".md") || has(".rst") || has(".txt") {
        tags.push("docs");
    }
    tags.push("cpm");
    let mut out: Vec<String> = tags.into_iter().map(String::from).collect();
    out.sort();
    out.dedup();
    out
}

/// Reload `{hash -> vector}` from a compatible previous build, if any.
fn load_existing_cache(
    packet_dir: &Path,
    model_name: &str,
    max_seq_length: u32,
) -> Option<(HashMap<String, Vec<f32>>, usize)> {
    let manifest_path = packet_dir.join(files::MANIFEST);
    let docs_path = packet_dir.join(files::DOCS);
    let vectors_path = packet_dir.join(files::VECTORS);
    if !(manifest_path.exists() && docs_path.exists() && vectors_path.exists()) {
        return None;
    }
    let manifest = load_manifest(&manifest_path).ok()?;
    if manifest.embedding.model != model_name {
        return None;
    }
    if let Some(prev) = manifest.embedding.max_seq_length {
        if prev != max_seq_length {
            return None;
        }
    }
    let dim = manifest.embedding.dim as usize;
    if dim == 0 {
        return None;
    }
    let records = read_docs_jsonl(&docs_path).ok()?;
    if records.is_empty() {
        return None;
    }
    let vectors = read_vectors_f16(&vectors_path, dim).ok()?;
    if vectors.nrows() != records.len() {
        return None;
    }
    let mut cache = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        if record.hash.len() >= 32 && !cache.contains_key(&record.hash) {
            cache.insert(record.hash.clone(), vectors.row(i).to_vec());
        }
    }
    Some((cache, dim))
}

/// The lock config payload: everything that changes the build output.
fn config_payload(config: &BuilderConfig) -> Value {
    json!({
        "model": config.model_name,
        "max_seq_length": config.max_seq_length,
        "chunk_tokens": config.chunking.chunk_tokens,
        "overlap_tokens": config.chunking.overlap_tokens,
        "lines_per_chunk": config.chunking.lines_per_chunk,
        "overlap_lines": config.chunking.overlap_lines,
        "hierarchical": config.chunking.hierarchical,
        "embed_url": config.embed_url,
    })
}

/// The resolved plan for a build request (also used by `build verify`).
pub fn plan_for(request: &BuildRequest, config: &BuilderConfig) -> CpmResult<ResolvedPlan> {
    build_resolved_plan(&PlanParams {
        source_path: &request.source_dir,
        packet_name: &request.name,
        packet_version: &config.version,
        packet_id: &request.name,
        build_profile: &config.build_profile,
        builder_plugin: "cpm:default-builder",
        builder_plugin_version: env!("CARGO_PKG_VERSION"),
        config_payload: config_payload(config),
        model_provider: "embed-pool",
        model_name: &config.model_name,
        model_dtype: "float16",
        normalize: true,
        max_seq_length: Some(config.max_seq_length),
    })
}

fn write_failed_manifest(
    request: &BuildRequest,
    config: &BuilderConfig,
    chunks: &[DocChunk],
    ext_counts: &BTreeMap<String, u64>,
) -> CpmResult<()> {
    let manifest = PacketManifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        packet_id: request.name.clone(),
        embedding: EmbeddingSpec {
            provider: Some("embed-pool".to_string()),
            model: config.model_name.clone(),
            dim: 0,
            dtype: "float16".to_string(),
            normalized: true,
            max_seq_length: Some(config.max_seq_length),
        },
        similarity: BTreeMap::new(),
        files: BTreeMap::new(),
        counts: BTreeMap::from([
            ("docs".to_string(), chunks.len() as u64),
            ("vectors".to_string(), 0),
        ]),
        source: BTreeMap::from([
            (
                "input_dir".to_string(),
                Value::from(normalize_rel_path(&request.source_dir)),
            ),
            ("file_ext_counts".to_string(), json!(ext_counts)),
        ]),
        cpm: BTreeMap::new(),
        incremental: BTreeMap::new(),
        checksums: BTreeMap::new(),
        extras: BTreeMap::from([(
            "build_status".to_string(),
            Value::from("embedding_failed"),
        )]),
    };
    write_manifest(&manifest, &request.packet_dir.join(files::MANIFEST))
}

/// Run a full packet build.
pub fn build_packet(
    request: &BuildRequest,
    config: &BuilderConfig,
    embedder: &dyn Embedder,
) -> CpmResult<BuildReport> {
    if !request.source_dir.exists() {
        return Err(CpmError::packet_not_found(format!(
            "source '{}' does not exist",
            request.source_dir.display()
        )));
    }
    std::fs::create_dir_all(request.packet_dir.join("faiss"))?;

    let (chunks, ext_counts, files_indexed) = scan_source(&request.source_dir, &config.chunking)?;
    info!(files_indexed, chunks_total = chunks.len(), "scan complete");
    if chunks.is_empty() {
        return Err(CpmError::missing_required("no chunks found in source tree"));
    }

    let cache_pack = load_existing_cache(
        &request.packet_dir,
        &config.model_name,
        config.max_seq_length,
    );
    let incremental_enabled = cache_pack.is_some();
    let (mut cache, cache_dim) = match cache_pack {
        Some((cache, dim)) => (cache, Some(dim)),
        None => (HashMap::new(), None),
    };

    let new_hashes: Vec<String> = chunks
        .iter()
        .map(|c| crate::determinism::sha256_hex(c.text.as_bytes()))
        .collect();
    let new_set: std::collections::HashSet<&str> =
        new_hashes.iter().map(String::as_str).collect();
    let removed = cache
        .keys()
        .filter(|h| !new_set.contains(h.as_str()))
        .count();
    let mut reused = new_hashes.iter().filter(|h| cache.contains_key(*h)).count();

    let mut to_embed_idx: Vec<usize> = Vec::new();
    let mut to_embed_texts: Vec<String> = Vec::new();
    for (i, hash) in new_hashes.iter().enumerate() {
        if !cache.contains_key(hash) {
            to_embed_idx.push(i);
            to_embed_texts.push(chunks[i].text.clone());
        }
    }
    info!(
        reused,
        to_embed = to_embed_idx.len(),
        removed,
        "incremental plan"
    );

    if !embedder.health() {
        warn!(embed_url = %config.embed_url, "embedding server not reachable");
        write_docs_jsonl(&chunks, &request.packet_dir.join(files::DOCS))?;
        write_failed_manifest(request, config, &chunks, &ext_counts)?;
        return Err(CpmError::embed_unreachable(format!(
            "embedding server not reachable at {}",
            config.embed_url
        )));
    }

    let options = EmbedOptions {
        model: config.model_name.clone(),
        max_seq_length: config.max_seq_length,
        normalize: true,
        dtype: VectorDtype::Float32,
        show_progress: true,
    };

    let mut missing = if !to_embed_texts.is_empty() {
        Some(embedder.embed_texts(&to_embed_texts, &options)?)
    } else {
        None
    };
    let mut dim = missing.as_ref().map(|m| m.dim()).or(cache_dim);
    if dim.is_none() {
        // Everything cached but the cache width is unknown: one-shot probe.
        let probe = embedder.embed_texts(&[chunks[0].text.clone()], &options)?;
        dim = Some(probe.dim());
        to_embed_idx = vec![0];
        missing = Some(probe);
    }
    let mut dim = dim.ok_or_else(|| CpmError::invariant("embedding dim unresolved"))?;

    if let Some(prev) = cache_dim {
        if prev != dim {
            warn!(cache_dim = prev, new_dim = dim, "cache dim mismatch; re-embedding all");
            cache.clear();
            reused = 0;
            to_embed_idx = (0..chunks.len()).collect();
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let all = embedder.embed_texts(&texts, &options)?;
            dim = all.dim();
            missing = Some(all);
        }
    }

    let mut final_vectors = Matrix::zeros(chunks.len(), dim);
    for (i, hash) in new_hashes.iter().enumerate() {
        if let Some(vector) = cache.get(hash) {
            final_vectors.set_row(i, vector)?;
        }
    }
    if let Some(missing) = &missing {
        if missing.nrows() != to_embed_idx.len() {
            return Err(CpmError::dim_mismatch(format!(
                "embedder returned {} rows for {} inputs",
                missing.nrows(),
                to_embed_idx.len()
            )));
        }
        for (j, &i) in to_embed_idx.iter().enumerate() {
            final_vectors.set_row(i, missing.row(j))?;
        }
    }

    write_docs_jsonl(&chunks, &request.packet_dir.join(files::DOCS))?;

    let index = FlatIpIndex::from_matrix(final_vectors.clone());
    index.save(&request.packet_dir.join(files::INDEX))?;
    write_vectors_f16(&final_vectors, &request.packet_dir.join(files::VECTORS))?;

    let tags = infer_tags(&ext_counts);
    let info = PacketInfo {
        cpm_schema: 1,
        name: request.name.clone(),
        version: config.version.clone(),
        description: request.description.clone(),
        tags: tags.clone(),
        entrypoints: vec!["query".to_string()],
        embedding_model: config.model_name.clone(),
        embedding_dim: dim as u32,
        embedding_normalized: true,
        created_at: request.generated_at.clone(),
    };
    write_packet_info(&info, &request.packet_dir.join(files::PACKET_INFO))?;

    let mut manifest = PacketManifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        packet_id: request.name.clone(),
        embedding: EmbeddingSpec {
            provider: Some("embed-pool".to_string()),
            model: config.model_name.clone(),
            dim: dim as u32,
            dtype: "float16".to_string(),
            normalized: true,
            max_seq_length: Some(config.max_seq_length),
        },
        similarity: BTreeMap::from([
            ("space".to_string(), Value::from("cosine")),
            ("index_type".to_string(), Value::from(INDEX_TYPE)),
            (
                "notes".to_string(),
                Value::from("cosine via inner product on normalized vectors"),
            ),
        ]),
        files: BTreeMap::from([
            ("docs".to_string(), Value::from(files::DOCS)),
            (
                "vectors".to_string(),
                json!({"path": files::VECTORS, "format": "f16_rowmajor"}),
            ),
            (
                "index".to_string(),
                json!({"path": files::INDEX, "format": INDEX_TYPE}),
            ),
        ]),
        counts: BTreeMap::from([
            ("docs".to_string(), chunks.len() as u64),
            ("vectors".to_string(), index.ntotal() as u64),
        ]),
        source: BTreeMap::from([
            (
                "input_dir".to_string(),
                Value::from(normalize_rel_path(&request.source_dir)),
            ),
            ("file_ext_counts".to_string(), json!(ext_counts)),
        ]),
        cpm: BTreeMap::from([
            ("name".to_string(), Value::from(request.name.as_str())),
            ("version".to_string(), Value::from(config.version.as_str())),
            ("tags".to_string(), json!(tags)),
            ("entrypoints".to_string(), json!(["query"])),
            (
                "description".to_string(),
                Value::from(request.description.as_str()),
            ),
        ]),
        incremental: BTreeMap::from([
            ("enabled".to_string(), Value::from(incremental_enabled)),
            ("reused".to_string(), Value::from(reused)),
            ("embedded".to_string(), Value::from(to_embed_idx.len())),
            ("removed".to_string(), Value::from(removed)),
        ]),
        checksums: BTreeMap::new(),
        extras: BTreeMap::new(),
    };
    manifest.checksums = compute_checksums(
        &request.packet_dir,
        &[files::PACKET_INFO, files::DOCS, files::VECTORS, files::INDEX],
    )?;
    write_manifest(&manifest, &request.packet_dir.join(files::MANIFEST))?;

    // Lockfile: a drifted plan fails the build unless the caller opted in.
    let plan = plan_for(request, config)?;
    let lock_path = request.packet_dir.join(files::LOCKFILE);
    if lock_path.exists() && !config.update_lock {
        let existing = load_lock(&lock_path)?;
        let verdict = verify_lock_against_plan(&existing, &plan);
        if !verdict.ok {
            return Err(CpmError::lock_mismatch(format!(
                "lockfile does not match current inputs ({}); pass --update-lock to regenerate",
                verdict.errors.join("; ")
            )));
        }
    }
    let lock = render_lock(
        &plan,
        artifact_hashes(&request.packet_dir)?,
        &request.generated_at,
        &request.cpm_version,
    );
    write_lock(&lock, &lock_path)?;

    let archive_path = if config.archive {
        Some(archive_packet_dir(
            &request.packet_dir,
            config.archive_format,
        )?)
    } else {
        None
    };

    Ok(BuildReport {
        manifest,
        chunk_count: chunks.len(),
        reused,
        embedded: to_embed_idx.len(),
        removed,
        archive_path,
    })
}

/// Archive the packet directory next to itself; the top-level entry is the
/// packet directory name.
pub fn archive_packet_dir(packet_dir: &Path, format: ArchiveFormat) -> CpmResult<PathBuf> {
    let dir_name = packet_dir
        .file_name()
        .ok_or_else(|| CpmError::invalid_config("packet dir has no name"))?
        .to_string_lossy()
        .to_string();
    let archive_path = PathBuf::from(format!(
        "{}.{}",
        packet_dir.display(),
        format.extension()
    ));
    if archive_path.exists() {
        std::fs::remove_file(&archive_path)?;
    }

    match format {
        ArchiveFormat::TarGz => {
            let file = File::create(&archive_path)?;
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(&dir_name, packet_dir)
                .map_err(|e| CpmError::io(format!("archive: {e}")))?;
            builder
                .into_inner()
                .map_err(|e| CpmError::io(format!("archive: {e}")))?
                .finish()
                .map_err(|e| CpmError::io(format!("archive: {e}")))?;
        }
        ArchiveFormat::Zip => {
            let file = File::create(&archive_path)?;
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for entry in walkdir::WalkDir::new(packet_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| CpmError::io(format!("archive walk: {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(packet_dir)
                    .map_err(|e| CpmError::invariant(format!("archive walk: {e}")))?;
                let arcname = format!("{dir_name}/{}", normalize_rel_path(rel));
                writer
                    .start_file(arcname, options)
                    .map_err(|e| CpmError::io(format!("archive: {e}")))?;
                let bytes = std::fs::read(entry.path())?;
                writer.write_all(&bytes)?;
            }
            writer
                .finish()
                .map_err(|e| CpmError::io(format!("archive: {e}")))?;
        }
    }
    Ok(archive_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic unit-vector embedder: text i of a call maps to e_i.
    struct UnitEmbedder {
        dim: usize,
        healthy: bool,
    }

    impl Embedder for UnitEmbedder {
        fn health(&self) -> bool {
            self.healthy
        }

        fn embed_texts(&self, texts: &[String], _options: &EmbedOptions) -> CpmResult<Matrix> {
            let mut m = Matrix::new(self.dim);
            for (i, _) in texts.iter().enumerate() {
                let mut row = vec![0.0f32; self.dim];
                row[i % self.dim] = 1.0;
                m.push_row(&row)?;
            }
            Ok(m)
        }
    }

    fn sample_request(source: &Path, packet: &Path) -> BuildRequest {
        BuildRequest {
            source_dir: source.to_path_buf(),
            packet_dir: packet.to_path_buf(),
            name: "docs".to_string(),
            description: "sample".to_string(),
            generated_at: "2024-05-01T00:00:00Z".to_string(),
            cpm_version: "0.1.0".to_string(),
        }
    }

    fn write_sources(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("intro.md"), "Welcome\nThis is a sample project\nEnd").unwrap();
        std::fs::write(dir.join("code.py"), "def hello():\n    return 42\n").unwrap();
    }

    #[test]
    fn build_produces_all_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("docs");
        let packet = tmp.path().join("out");
        write_sources(&source);

        let mut config = BuilderConfig::default();
        config.version = "1.2.3".to_string();
        let report = build_packet(
            &sample_request(&source, &packet),
            &config,
            &UnitEmbedder { dim: 4, healthy: true },
        )
        .unwrap();

        assert_eq!(report.chunk_count, 2);
        assert_eq!(report.manifest.doc_count(), 2);
        assert_eq!(report.manifest.vector_count(), 2);
        assert_eq!(report.manifest.embedding.dim, 4);
        assert!(crate::packet::is_complete(&packet));

        let vectors = read_vectors_f16(&packet.join(files::VECTORS), 4).unwrap();
        assert_eq!(vectors.nrows(), 2);

        let lock = load_lock(&packet.join(files::LOCKFILE)).unwrap();
        assert_eq!(lock.packet.name, "docs");
        assert_eq!(lock.packet.version, "1.2.3");
        assert_eq!(lock.artifacts.len(), 4);
    }

    #[test]
    fn rebuild_without_update_lock_fails_on_drift() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("docs");
        let packet = tmp.path().join("out");
        write_sources(&source);

        let config = BuilderConfig::default();
        let embedder = UnitEmbedder { dim: 4, healthy: true };
        build_packet(&sample_request(&source, &packet), &config, &embedder).unwrap();
        let lock_before = std::fs::read_to_string(packet.join(files::LOCKFILE)).unwrap();

        std::fs::write(source.join("intro.md"), "Edited content entirely").unwrap();
        let err = build_packet(&sample_request(&source, &packet), &config, &embedder).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::LockMismatch);
        let lock_after = std::fs::read_to_string(packet.join(files::LOCKFILE)).unwrap();
        assert_eq!(lock_before, lock_after);

        let mut updated = config.clone();
        updated.update_lock = true;
        build_packet(&sample_request(&source, &packet), &updated, &embedder).unwrap();
        let lock_new = std::fs::read_to_string(packet.join(files::LOCKFILE)).unwrap();
        assert_ne!(lock_before, lock_new);
    }

    #[test]
    fn rebuild_reuses_cached_vectors() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("docs");
        let packet = tmp.path().join("out");
        write_sources(&source);

        let config = BuilderConfig::default();
        let embedder = UnitEmbedder { dim: 4, healthy: true };
        let first = build_packet(&sample_request(&source, &packet), &config, &embedder).unwrap();
        assert_eq!(first.embedded, 2);
        assert_eq!(first.reused, 0);

        let second = build_packet(&sample_request(&source, &packet), &config, &embedder).unwrap();
        assert_eq!(second.reused, 2);
        // The cache dim is known, so only the 1-shot probe path could embed.
        assert!(second.embedded <= 1);
    }

    #[test]
    fn unhealthy_embedder_leaves_failure_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("docs");
        let packet = tmp.path().join("out");
        write_sources(&source);

        let config = BuilderConfig::default();
        let err = build_packet(
            &sample_request(&source, &packet),
            &config,
            &UnitEmbedder { dim: 4, healthy: false },
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::EmbedUnreachable);

        let manifest = load_manifest(&packet.join(files::MANIFEST)).unwrap();
        assert_eq!(manifest.embedding.dim, 0);
        assert_eq!(manifest.vector_count(), 0);
        assert_eq!(
            manifest.extras.get("build_status").and_then(|v| v.as_str()),
            Some("embedding_failed")
        );
        assert!(packet.join(files::DOCS).exists());
    }

    #[test]
    fn archive_contains_packet_dir_name() {
        let tmp = tempfile::tempdir().unwrap();
        let packet = tmp.path().join("mypkt");
        std::fs::create_dir_all(packet.join("faiss")).unwrap();
        std::fs::write(packet.join("manifest.json"), "{}").unwrap();

        let path = archive_packet_dir(&packet, ArchiveFormat::TarGz).unwrap();
        assert!(path.to_string_lossy().ends_with("mypkt.tar.gz"));
        assert!(path.exists());

        let path = archive_packet_dir(&packet, ArchiveFormat::Zip).unwrap();
        assert!(path.to_string_lossy().ends_with("mypkt.zip"));
        assert!(path.exists());
    }
}
