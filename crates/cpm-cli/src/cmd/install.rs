//! `cpm install` - OCI-backed install with policy and trust gates.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use cpm_core::policy::{evaluate_policy, load_policy, PolicyContext};
use cpm_registry::oci::package_ref_for;
use cpm_registry::{evaluate_trust_report, OciClient};
use cpm_store::{parse_package_spec, write_install_lock, InstallLock};
use cpm_store::install_lock::InstallSource;

use crate::app::CpmApp;
use crate::args::InstallArgs;
use crate::config::{CliConfig, EmbeddingProvider, EmbeddingsConfig};
use crate::output;

pub fn run(app: &CpmApp, args: InstallArgs) -> i32 {
    match install(app, &args) {
        Ok(()) => 0,
        Err(message) => {
            output::error_line("install", message, None);
            1
        }
    }
}

fn install(app: &CpmApp, args: &InstallArgs) -> Result<(), String> {
    let policy = load_policy(&app.layout.root);
    let (name, version) = parse_package_spec(&args.spec);
    let version = version.ok_or("version is required (use name@version)")?;

    let config = CliConfig::load(&app.layout);
    let repository = args
        .registry
        .clone()
        .or_else(|| config.oci.repository.clone())
        .ok_or("missing OCI repository. Set --registry or [oci].repository in config.toml")?;

    let client = OciClient::new(config.oci_client_config(args.insecure));
    let reference = package_ref_for(&name, &version, &repository);
    let source_uri = format!("oci://{reference}");

    // Policy gate #1: source allowlist.
    let decision = evaluate_policy(
        &policy,
        &PolicyContext {
            source_uri: Some(&source_uri),
            ..Default::default()
        },
    );
    if !decision.allow {
        return Err(format!("policy deny source={source_uri} reason={}", decision.reason));
    }

    let digest = client.resolve(&reference).map_err(|e| e.to_string())?;
    let repo_ref = reference.split('@').next().unwrap_or(&reference);
    let referrers = client
        .discover_referrers(&format!("{repo_ref}@{digest}"))
        .map_err(|e| e.to_string())?;
    let verification = evaluate_trust_report(
        &referrers,
        config.oci.strict_verify,
        config.oci.require_signature,
        config.oci.require_sbom,
        config.oci.require_provenance,
    );
    if !verification.strict_failures.is_empty() {
        return Err(format!(
            "verification failed (strict): {}",
            verification.strict_failures.join(",")
        ));
    }

    // Policy gate #2: trust score with verification evidence.
    let decision = evaluate_policy(
        &policy,
        &PolicyContext {
            source_uri: Some(&source_uri),
            trust_score: Some(verification.trust_score),
            strict_failures: &verification.strict_failures,
            ..Default::default()
        },
    );
    if !decision.allow {
        return Err(format!("policy deny source={source_uri} reason={}", decision.reason));
    }

    // Remote hub verdict, when configured. In enforce mode an unreachable
    // hub denies the install.
    let hub = cpm_registry::HubClient::new(config.hub_settings());
    let hub_context = serde_json::json!({
        "action": "install",
        "source_uri": source_uri,
        "trust_score": verification.trust_score,
    });
    let hub_policy = serde_json::to_value(&policy).unwrap_or(Value::Null);
    if let Some(verdict) = hub.evaluate_policy(&hub_context, &hub_policy) {
        let allow = verdict.get("allow").and_then(|v| v.as_bool()).unwrap_or(false);
        if !allow {
            let reason = verdict
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("hub_denied");
            return Err(format!("policy deny source={source_uri} reason={reason}"));
        }
    }

    // Pull into a scratch dir and validate the artifact shape.
    let scratch = app.layout.cache_dir().join("tmp-install").join(&name);
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch).map_err(|e| e.to_string())?;
    }
    let pull = client.pull(&reference, &scratch).map_err(|e| e.to_string())?;

    let packet_manifest_path = scratch.join("packet.manifest.json");
    if !packet_manifest_path.exists() {
        return Err("pulled OCI artifact does not contain packet.manifest.json".to_string());
    }
    let artifact_manifest: Value = std::fs::read_to_string(&packet_manifest_path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))?;
    let payload_root = artifact_manifest
        .get("payload_root")
        .and_then(|v| v.as_str())
        .unwrap_or("payload");
    let payload_dir = scratch.join(payload_root);
    if !payload_dir.exists() {
        return Err(format!(
            "payload directory not found in artifact: {}",
            payload_dir.display()
        ));
    }

    let target_dir = app
        .store
        .layout()
        .version_dir(&name, &version)
        .map_err(|e| e.to_string())?;
    if target_dir.exists() {
        std::fs::remove_dir_all(&target_dir).map_err(|e| e.to_string())?;
    }
    copy_tree(&payload_dir, &target_dir).map_err(|e| e.to_string())?;

    if args.no_embed {
        let vectors = target_dir.join("vectors.f16.bin");
        if vectors.exists() {
            std::fs::remove_file(&vectors).map_err(|e| e.to_string())?;
        }
        let index_dir = target_dir.join("faiss");
        if index_dir.exists() {
            std::fs::remove_dir_all(&index_dir).map_err(|e| e.to_string())?;
        }
    }

    // Model selection + optional model artifact pull.
    let mut selected_model = None;
    let mut selected_provider = None;
    let mut suggested_retriever = None;
    let mut model_artifact = None;
    if !args.no_embed {
        let source_manifest = artifact_manifest
            .get("source_manifest")
            .cloned()
            .unwrap_or(Value::Null);
        let selection = select_model(
            app,
            &source_manifest,
            args.model.as_deref(),
            args.provider.as_deref(),
            args.force_discovery,
        );
        let Some(model) = selection.model else {
            return Err("unable to resolve embedding model for this packet".to_string());
        };
        model_artifact = maybe_pull_model_artifact(
            app,
            &client,
            selection.provider.as_deref(),
            &model,
        )?;
        selected_model = Some(model);
        selected_provider = selection.provider;
        suggested_retriever = selection.suggested_retriever;
    }

    app.store
        .use_version(&name, Some(&version))
        .map_err(|e| e.to_string())?;

    let lock = InstallLock {
        name: name.clone(),
        version: version.clone(),
        packet_ref: Some(reference.clone()),
        packet_digest: Some(digest.clone()),
        sources: vec![InstallSource {
            uri: source_uri.clone(),
            digest: digest.clone(),
            signature: verification.signature_valid,
            sbom: verification.sbom_present,
            provenance: verification.provenance_present,
            trust_score: verification.trust_score,
        }],
        signature: verification.signature_valid,
        sbom: verification.sbom_present,
        provenance: verification.provenance_present,
        trust_score: verification.trust_score,
        selected_model: selected_model.clone(),
        selected_provider: selected_provider.clone(),
        suggested_retriever,
        installed_at: Utc::now().timestamp(),
        artifact_files: pull
            .files
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect(),
        no_embed: args.no_embed,
        model_artifact,
        auto_resolved_by_query: false,
    };
    let lock_path = write_install_lock(&app.layout, &name, &lock, Utc::now())
        .map_err(|e| e.to_string())?;

    let _ = std::fs::remove_dir_all(&scratch);

    output::line("install", format!("installed {name}@{version} digest={digest}"));
    if args.no_embed {
        output::line("install", "mode=no-embed (vectors/index removed)");
    } else {
        output::line(
            "install",
            format!(
                "selected model={} provider={}",
                selected_model.as_deref().unwrap_or("-"),
                selected_provider.as_deref().unwrap_or("-")
            ),
        );
    }
    output::line("install", format!("lock={}", lock_path.display()));
    Ok(())
}

struct ModelSelection {
    model: Option<String>,
    provider: Option<String>,
    suggested_retriever: Option<String>,
}

fn manifest_field<'a>(manifest: &'a Value, key: &str) -> Option<&'a Value> {
    manifest
        .get(key)
        .or_else(|| manifest.get("extras").and_then(|e| e.get(key)))
}

fn string_field(manifest: &Value, key: &str) -> Option<String> {
    manifest_field(manifest, key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn supported_models(manifest: &Value) -> Vec<String> {
    match manifest_field(manifest, "supported_models") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    // `*` wildcard only; enough for model family globs like `jinaai/*`.
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                rest = &rest[pos + part.len()..];
            }
            None => return false,
        }
    }
    parts.last().map(|p| p.is_empty()).unwrap_or(false) || rest.is_empty()
}

/// Selection order: explicit `--model`, the packet's `recommended_model`,
/// then the first discovered provider model matching `supported_models`.
fn select_model(
    app: &CpmApp,
    manifest: &Value,
    requested_model: Option<&str>,
    requested_provider: Option<&str>,
    force_discovery: bool,
) -> ModelSelection {
    let suggested_retriever = string_field(manifest, "suggested_retriever");
    let supported = supported_models(manifest);
    let embeddings = EmbeddingsConfig::load(&app.layout);

    let providers: Vec<(String, EmbeddingProvider)> = match requested_provider {
        Some(wanted) => embeddings
            .providers
            .iter()
            .filter(|(name, _)| name.as_str() == wanted)
            .map(|(name, p)| (name.clone(), p.clone()))
            .collect(),
        None => embeddings
            .providers
            .iter()
            .map(|(name, p)| (name.clone(), p.clone()))
            .collect(),
    };

    let discover = |provider: &EmbeddingProvider| -> Vec<String> {
        if force_discovery || provider.model.is_none() {
            embeddings.discover_models(provider)
        } else {
            Vec::new()
        }
    };

    let find_provider_for = |model: &str| -> Option<String> {
        for (name, provider) in &providers {
            if provider.model.as_deref() == Some(model) {
                return Some(name.clone());
            }
            if discover(provider).iter().any(|m| m == model) {
                return Some(name.clone());
            }
        }
        providers.first().map(|(name, _)| name.clone())
    };

    if let Some(model) = requested_model {
        return ModelSelection {
            provider: find_provider_for(model),
            model: Some(model.to_string()),
            suggested_retriever,
        };
    }
    if let Some(recommended) = string_field(manifest, "recommended_model") {
        return ModelSelection {
            provider: find_provider_for(&recommended),
            model: Some(recommended),
            suggested_retriever,
        };
    }
    for (name, provider) in &providers {
        let mut candidates = discover(provider);
        if candidates.is_empty() {
            if let Some(model) = &provider.model {
                candidates.push(model.clone());
            }
        }
        for model in candidates {
            if supported.is_empty() || supported.iter().any(|p| glob_matches(p, &model)) {
                return ModelSelection {
                    model: Some(model),
                    provider: Some(name.clone()),
                    suggested_retriever,
                };
            }
        }
    }
    ModelSelection {
        model: None,
        provider: providers.first().map(|(name, _)| name.clone()),
        suggested_retriever,
    }
}

/// Pull the provider's model artifact when it declares an OCI source.
fn maybe_pull_model_artifact(
    app: &CpmApp,
    client: &OciClient,
    provider_name: Option<&str>,
    model_name: &str,
) -> Result<Option<BTreeMap<String, Value>>, String> {
    let Some(provider_name) = provider_name else {
        return Ok(None);
    };
    let embeddings = EmbeddingsConfig::load(&app.layout);
    let Ok(provider) = embeddings.get(provider_name) else {
        return Ok(None);
    };
    let source = provider
        .model_artifacts
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if source != "oci" {
        return Ok(None);
    }
    let Some(template) = provider
        .model_artifacts
        .get("ref_template")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        return Ok(None);
    };
    let reference = template
        .replace("{model}", model_name)
        .replace("{provider}", provider_name);
    let digest = client.resolve(&reference).map_err(|e| e.to_string())?;
    let cache_dir = app
        .layout
        .models_cache_dir()
        .join(provider_name)
        .join(model_name.replace('/', "_"));
    if cache_dir.exists() {
        std::fs::remove_dir_all(&cache_dir).map_err(|e| e.to_string())?;
    }
    client.pull(&reference, &cache_dir).map_err(|e| e.to_string())?;

    Ok(Some(BTreeMap::from([
        ("ref".to_string(), Value::from(reference)),
        ("digest".to_string(), Value::from(digest)),
        (
            "path".to_string(),
            Value::from(cache_dir.to_string_lossy().replace('\\', "/")),
        ),
    ])))
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_matches("jinaai/*", "jinaai/jina-embeddings-v2-base-code"));
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("jinaai/*", "openai/text-embedding-3-small"));
        assert!(glob_matches("*base*", "jina-base-code"));
        assert!(!glob_matches("*base", "base-code"));
    }

    #[test]
    fn manifest_fields_fall_back_to_extras() {
        let manifest = serde_json::json!({
            "extras": {"recommended_model": "m1", "suggested_retriever": "acme:lookup"}
        });
        assert_eq!(string_field(&manifest, "recommended_model").as_deref(), Some("m1"));
        assert_eq!(
            string_field(&manifest, "suggested_retriever").as_deref(),
            Some("acme:lookup")
        );
        assert!(string_field(&manifest, "missing").is_none());
    }
}
