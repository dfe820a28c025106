//! Lockfile schema and verification (`packet.lock.json`).
//!
//! The lockfile is the deterministic record of what produced a packet:
//! hashed inputs, the pipeline steps with their config hash, the embedding
//! models, and the artifact hashes. All map hashes use canonical JSON;
//! artifact hashes are sha256 over file bytes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::determinism::{
    directory_tree_hash, hash_canonical, normalize_rel_path, sha256_file_hex,
};
use crate::errors::{CpmError, CpmResult};
use crate::{files, LOCKFILE_VERSION};

/// `packet` section of the lockfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockPacket {
    pub name: String,
    pub version: String,
    pub packet_id: String,
    pub resolved_packet_id: String,
    pub build_profile: String,
}

/// One hashed build input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInput {
    pub kind: String,
    pub r#ref: String,
    pub hash: String,
}

/// One pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStep {
    pub step: String,
    pub plugin: String,
    pub plugin_version: String,
    pub config_hash: String,
    pub params: BTreeMap<String, Value>,
}

/// One embedding model entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockModel {
    pub provider: String,
    pub model: String,
    pub revision: Option<String>,
    pub dtype: String,
    pub device_policy: String,
    pub normalize: bool,
    pub max_seq_length: Option<u32>,
}

/// `resolution` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockResolution {
    pub generated_at: String,
    pub cpm_version: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The full lockfile document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    #[serde(rename = "lockfileVersion")]
    pub lockfile_version: u64,
    pub packet: LockPacket,
    pub inputs: Vec<LockInput>,
    pub pipeline: Vec<LockStep>,
    pub models: Vec<LockModel>,
    pub artifacts: BTreeMap<String, String>,
    pub resolution: LockResolution,
}

/// The deterministic part of a lockfile, computed from build parameters
/// before artifacts exist.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub packet: LockPacket,
    pub inputs: Vec<LockInput>,
    pub pipeline: Vec<LockStep>,
    pub models: Vec<LockModel>,
    pub warnings: Vec<String>,
}

/// Parameters hashed into the resolved plan.
#[derive(Debug, Clone)]
pub struct PlanParams<'a> {
    pub source_path: &'a Path,
    pub packet_name: &'a str,
    pub packet_version: &'a str,
    pub packet_id: &'a str,
    pub build_profile: &'a str,
    pub builder_plugin: &'a str,
    pub builder_plugin_version: &'a str,
    pub config_payload: Value,
    pub model_provider: &'a str,
    pub model_name: &'a str,
    pub model_dtype: &'a str,
    pub normalize: bool,
    pub max_seq_length: Option<u32>,
}

fn hash_inputs(source_path: &Path) -> CpmResult<Vec<LockInput>> {
    let resolved = source_path
        .canonicalize()
        .unwrap_or_else(|_| source_path.to_path_buf());
    if resolved.is_file() {
        return Ok(vec![LockInput {
            kind: "file".to_string(),
            r#ref: normalize_rel_path(&resolved),
            hash: sha256_file_hex(&resolved)?,
        }]);
    }
    if resolved.is_dir() {
        return Ok(vec![LockInput {
            kind: "dir".to_string(),
            r#ref: normalize_rel_path(&resolved),
            hash: directory_tree_hash(&resolved)?,
        }]);
    }
    Ok(Vec::new())
}

/// Build the resolved plan for a set of build parameters.
pub fn build_resolved_plan(params: &PlanParams<'_>) -> CpmResult<ResolvedPlan> {
    let config_hash = hash_canonical(&params.config_payload)?;

    let step = |name: &str, step_params: Value| LockStep {
        step: name.to_string(),
        plugin: params.builder_plugin.to_string(),
        plugin_version: params.builder_plugin_version.to_string(),
        config_hash: config_hash.clone(),
        params: step_params
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default(),
    };

    let pipeline = vec![
        step(
            "build",
            json!({
                "packet_name": params.packet_name,
                "packet_version": params.packet_version,
            }),
        ),
        step(
            "embed",
            json!({
                "model": params.model_name,
                "normalize": params.normalize,
                "max_seq_length": params.max_seq_length,
            }),
        ),
        step("index", json!({"index": crate::packet::index::INDEX_TYPE})),
    ];

    let models = vec![LockModel {
        provider: params.model_provider.to_string(),
        model: params.model_name.to_string(),
        revision: None,
        dtype: params.model_dtype.to_string(),
        device_policy: "runtime-default".to_string(),
        normalize: params.normalize,
        max_seq_length: params.max_seq_length,
    }];

    let source_ref = normalize_rel_path(
        &params
            .source_path
            .canonicalize()
            .unwrap_or_else(|_| params.source_path.to_path_buf()),
    );
    let resolved_packet_id = hash_canonical(&json!({
        "name": params.packet_name,
        "version": params.packet_version,
        "build_profile": params.build_profile,
        "source_path": source_ref,
        "config_hash": config_hash,
    }))?;

    Ok(ResolvedPlan {
        packet: LockPacket {
            name: params.packet_name.to_string(),
            version: params.packet_version.to_string(),
            packet_id: params.packet_id.to_string(),
            resolved_packet_id,
            build_profile: params.build_profile.to_string(),
        },
        inputs: hash_inputs(params.source_path)?,
        pipeline,
        models,
        warnings: Vec::new(),
    })
}

/// Hash the four packet artifacts that exist under `packet_dir`.
pub fn artifact_hashes(packet_dir: &Path) -> CpmResult<BTreeMap<String, String>> {
    let targets = [
        ("chunks_manifest_hash", files::DOCS),
        ("embeddings_hash", files::VECTORS),
        ("index_hash", files::INDEX),
        ("packet_manifest_hash", files::MANIFEST),
    ];
    let mut out = BTreeMap::new();
    for (key, rel) in targets {
        let path = packet_dir.join(rel);
        if path.exists() {
            out.insert(key.to_string(), sha256_file_hex(&path)?);
        }
    }
    Ok(out)
}

/// Render a plan + artifact hashes into a lockfile document.
pub fn render_lock(
    plan: &ResolvedPlan,
    artifacts: BTreeMap<String, String>,
    generated_at: &str,
    cpm_version: &str,
) -> Lockfile {
    Lockfile {
        lockfile_version: LOCKFILE_VERSION,
        packet: plan.packet.clone(),
        inputs: plan.inputs.clone(),
        pipeline: plan.pipeline.clone(),
        models: plan.models.clone(),
        artifacts,
        resolution: LockResolution {
            generated_at: generated_at.to_string(),
            cpm_version: cpm_version.to_string(),
            warnings: plan.warnings.clone(),
        },
    }
}

pub fn write_lock(lock: &Lockfile, path: &Path) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(lock)?)?;
    Ok(())
}

pub fn load_lock(path: &Path) -> CpmResult<Lockfile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CpmError::io(format!("unable to read {}: {e}", path.display())))?;
    let lock: Lockfile = serde_json::from_str(&raw)
        .map_err(|e| CpmError::lock_mismatch(format!("invalid lockfile {}: {e}", path.display())))?;
    Ok(lock)
}

/// Verification outcome: empty errors means pass.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }
}

/// Compare an existing lockfile against a freshly computed plan.
pub fn verify_lock_against_plan(lock: &Lockfile, plan: &ResolvedPlan) -> VerifyResult {
    let mut errors = Vec::new();
    if lock.lockfile_version != LOCKFILE_VERSION {
        errors.push(format!(
            "lockfileVersion mismatch: expected={LOCKFILE_VERSION} got={}",
            lock.lockfile_version
        ));
    }
    if lock.packet != plan.packet {
        errors.push(format!(
            "packet mismatch: expected={:?} got={:?}",
            plan.packet, lock.packet
        ));
    }
    if lock.inputs != plan.inputs {
        errors.push("inputs mismatch".to_string());
    }
    if lock.pipeline != plan.pipeline {
        errors.push("pipeline mismatch".to_string());
    }
    if lock.models != plan.models {
        errors.push("models mismatch".to_string());
    }
    VerifyResult::from_errors(errors)
}

/// Recompute artifact hashes and compare with the lockfile's record.
pub fn verify_artifacts(lock: &Lockfile, packet_dir: &Path) -> CpmResult<VerifyResult> {
    let actual = artifact_hashes(packet_dir)?;
    let mut errors = Vec::new();
    for (key, expected) in &lock.artifacts {
        match actual.get(key) {
            None => errors.push(format!("artifact missing: {key}")),
            Some(found) if found != expected => errors.push(format!(
                "artifact hash mismatch for {key}: expected={expected} got={found}"
            )),
            Some(_) => {}
        }
    }
    Ok(VerifyResult::from_errors(errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_for(dir: &Path, version: &str) -> ResolvedPlan {
        build_resolved_plan(&PlanParams {
            source_path: dir,
            packet_name: "docs",
            packet_version: version,
            packet_id: "docs",
            build_profile: "default",
            builder_plugin: "cpm:default-builder",
            builder_plugin_version: "0.1.0",
            config_payload: json!({"model": "m", "max_seq_length": 1024}),
            model_provider: "embed-pool",
            model_name: "m",
            model_dtype: "float16",
            normalize: true,
            max_seq_length: Some(1024),
        })
        .unwrap()
    }

    #[test]
    fn plan_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "hello").unwrap();
        let a = plan_for(dir.path(), "1.2.3");
        let b = plan_for(dir.path(), "1.2.3");
        assert_eq!(a, b);
        assert_eq!(a.packet.name, "docs");
        assert_eq!(a.packet.version, "1.2.3");
        assert_eq!(a.inputs.len(), 1);
        assert_eq!(a.inputs[0].kind, "dir");
        assert_eq!(a.pipeline.len(), 3);
    }

    #[test]
    fn input_drift_changes_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "hello").unwrap();
        let before = plan_for(dir.path(), "1.2.3");
        std::fs::write(dir.path().join("a.md"), "changed").unwrap();
        let after = plan_for(dir.path(), "1.2.3");
        assert_ne!(before.inputs, after.inputs);

        let lock = render_lock(&before, BTreeMap::new(), "2024-01-01T00:00:00Z", "0.1.0");
        let verdict = verify_lock_against_plan(&lock, &after);
        assert!(!verdict.ok);
        assert!(verdict.errors.iter().any(|e| e.contains("inputs")));
    }

    #[test]
    fn artifact_tampering_names_embeddings_hash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docs.jsonl"), "{}").unwrap();
        std::fs::write(dir.path().join("vectors.f16.bin"), [0u8, 1, 2, 3]).unwrap();
        std::fs::create_dir_all(dir.path().join("faiss")).unwrap();
        std::fs::write(dir.path().join("faiss/index.faiss"), "idx").unwrap();
        std::fs::write(dir.path().join("manifest.json"), "{}").unwrap();

        let src = tempfile::tempdir().unwrap();
        let plan = plan_for(src.path(), "1.0.0");
        let lock = render_lock(
            &plan,
            artifact_hashes(dir.path()).unwrap(),
            "2024-01-01T00:00:00Z",
            "0.1.0",
        );

        std::fs::write(dir.path().join("vectors.f16.bin"), [9u8, 9, 9, 9]).unwrap();
        let verdict = verify_artifacts(&lock, dir.path()).unwrap();
        assert!(!verdict.ok);
        assert!(verdict.errors.iter().any(|e| e.contains("embeddings_hash")));
    }

    #[test]
    fn lock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let plan = plan_for(src.path(), "1.0.0");
        let lock = render_lock(&plan, BTreeMap::new(), "2024-01-01T00:00:00Z", "0.1.0");
        let path = dir.path().join("packet.lock.json");
        write_lock(&lock, &path).unwrap();
        let back = load_lock(&path).unwrap();
        assert_eq!(back, lock);
    }
}
