//! `cpm query` - the retrieval pipeline front-end.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::packet::io::load_manifest;
use cpm_core::retrieve::{RetrievalPayload, RetrievalRequest};
use cpm_core::files;
use cpm_registry::OciClient;
use cpm_store::{
    objects, parse_package_spec, read_install_lock, read_install_lock_as_of, write_install_lock,
    InstallLock,
};

use crate::app::CpmApp;
use crate::args::QueryArgs;
use crate::config::{CliConfig, EmbeddingsConfig};
use crate::output;

pub fn run(app: &CpmApp, args: QueryArgs) -> i32 {
    let payload = execute(app, &args);
    let ok = payload.ok;

    if let Some(path) = &args.save_log {
        if let Err(e) = save_log(&payload, Path::new(path)) {
            output::error_line("query", format!("unable to save log: {e}"), None);
            return 1;
        }
    }

    if output::is_json() {
        let _ = output::print_json(&payload);
    } else {
        print_text(&payload);
    }
    i32::from(!ok)
}

/// A store-resolved packet reference.
pub struct ResolvedPacketRef {
    pub name: String,
    pub version: String,
}

/// Resolve the packet reference to a concrete directory.
///
/// Accepted shapes: absolute/relative path, `name[@version]`, `dir://` and
/// `oci://` source URIs. `--as-of` substitutes the version recorded in the
/// nearest historical install lock.
pub fn resolve_packet_dir(
    app: &CpmApp,
    packet: &str,
    as_of: Option<&str>,
) -> CpmResult<(PathBuf, Option<ResolvedPacketRef>)> {
    if let Some(rest) = packet.strip_prefix("oci://") {
        let config = CliConfig::load(&app.layout);
        let client = OciClient::new(config.oci_client_config(false));
        let slot = objects::object_dir(&app.layout, packet);
        if slot.exists() {
            std::fs::remove_dir_all(&slot)?;
        }
        client.pull(rest, &slot)?;
        let payload = slot.join("payload");
        return Ok((if payload.is_dir() { payload } else { slot }, None));
    }
    if packet.starts_with("dir://") {
        return Ok((objects::fetch_dir_source(&app.layout, packet)?, None));
    }

    let direct = Path::new(packet);
    if direct.is_dir() {
        return Ok((direct.to_path_buf(), None));
    }

    let (name, explicit_version) = parse_package_spec(packet);
    if name.is_empty() {
        return Err(CpmError::invalid_spec("empty packet reference"));
    }

    let mut target_version = explicit_version;
    if let Some(stamp) = as_of {
        let as_of_time: DateTime<Utc> = stamp
            .parse()
            .map_err(|e| CpmError::invalid_spec(format!("invalid --as-of timestamp: {e}")))?;
        match read_install_lock_as_of(&app.layout, &name, as_of_time) {
            Some(lock) => target_version = Some(lock.version),
            None => {
                return Err(CpmError::packet_not_found(format!(
                    "no install-lock history for {name} at or before {stamp}"
                )))
            }
        }
    }

    let version = app.store.resolve_version(&name, target_version.as_deref())?;
    let dir = app.store.layout().version_dir(&name, &version)?;
    if !dir.exists() {
        return Err(CpmError::packet_not_found(format!(
            "packet directory missing for {name}@{version}: {}",
            dir.display()
        )));
    }
    Ok((dir, Some(ResolvedPacketRef { name, version })))
}

/// Make sure an install lock exists for a store-resolved packet; queries
/// against never-installed packets get one auto-written from the manifest.
fn ensure_install_lock(
    app: &CpmApp,
    name: &str,
    version: &str,
    packet_dir: &Path,
) -> Option<InstallLock> {
    if let Some(existing) = read_install_lock(&app.layout, name) {
        return Some(existing);
    }
    let manifest = load_manifest(&packet_dir.join(files::MANIFEST)).ok()?;
    let model = manifest.embedding.model.trim().to_string();
    if model.is_empty() {
        return None;
    }
    let embeddings = EmbeddingsConfig::load(&app.layout);
    let provider = embeddings.default_provider().map(|(name, _)| name.clone());
    let lock = InstallLock::auto_resolved(
        name,
        version,
        &model,
        provider,
        manifest.suggested_retriever(),
        Utc::now().timestamp(),
    );
    match write_install_lock(&app.layout, name, &lock, Utc::now()) {
        Ok(_) => Some(lock),
        Err(e) => {
            output::error_line("query", format!("unable to write install lock: {e}"), None);
            None
        }
    }
}

fn execute(app: &CpmApp, args: &QueryArgs) -> RetrievalPayload {
    let mut request = RetrievalRequest::new(&args.packet, &args.query, args.k);
    request.indexer = args.indexer.clone();
    request.reranker = args.reranker.clone();
    request.max_context_tokens = args.max_context_tokens;

    // The workspace policy caps the context token budget.
    let policy = cpm_core::policy::load_policy(&app.layout.root);
    let decision = cpm_core::policy::evaluate_policy(
        &policy,
        &cpm_core::policy::PolicyContext {
            token_count: Some(request.max_context_tokens),
            ..Default::default()
        },
    );
    if !decision.allow {
        return failed_payload(
            &request,
            "policy_deny",
            format!(
                "reason={} (max_context_tokens={} > policy max_tokens={})",
                decision.reason, request.max_context_tokens, policy.max_tokens
            ),
        );
    }

    let (packet_dir, store_ref) =
        match resolve_packet_dir(app, &args.packet, args.as_of.as_deref()) {
            Ok(resolved) => resolved,
            Err(e) => {
                return failed_payload(&request, "packet_not_found", e.to_string());
            }
        };

    let install_lock = store_ref
        .as_ref()
        .and_then(|r| ensure_install_lock(app, &r.name, &r.version, &packet_dir));
    if let Some(lock) = &install_lock {
        request.selected_model = lock
            .selected_model
            .clone()
            .filter(|m| !m.trim().is_empty());
    }

    let suggested = install_lock
        .as_ref()
        .and_then(|l| l.suggested_retriever.clone());
    let (retriever_name, retriever) =
        match app.resolve_retriever(args.retriever.as_deref(), suggested.as_deref()) {
            Ok(resolved) => resolved,
            Err(e) => {
                return failed_payload(&request, "retriever_unavailable", e.to_string());
            }
        };

    let embedder = match app.embedder(args.embed_url.as_deref(), args.embed_mode.as_deref()) {
        Ok(embedder) => embedder,
        Err(e) => return failed_payload(&request, "invalid_config", e.to_string()),
    };

    if !output::is_json() {
        output::line("query", format!("retriever={retriever_name}"));
    }
    let mut payload = retriever.retrieve(&packet_dir, &request, embedder.as_ref());
    if let Some(store_ref) = &store_ref {
        payload.packet_version = Some(store_ref.version.clone());
    }
    payload
}

fn failed_payload(request: &RetrievalRequest, error: &str, detail: String) -> RetrievalPayload {
    let mut payload = RetrievalPayload {
        ok: false,
        error: Some(error.to_string()),
        detail: Some(detail),
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
    };
    if error == "packet_not_found" {
        payload.hint = Some("install the packet first: `cpm install <name>@<version>`".to_string());
    }
    payload
}

fn save_log(payload: &RetrievalPayload, path: &Path) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn print_text(payload: &RetrievalPayload) {
    if !payload.ok {
        output::error_line(
            "query",
            format!(
                "error={} detail={}",
                payload.error.as_deref().unwrap_or("unknown_error"),
                payload.detail.as_deref().unwrap_or("-")
            ),
            payload.hint.as_deref(),
        );
        return;
    }
    output::line(
        "query",
        format!(
            "packet={} k={} indexer={} reranker={} hash={}",
            payload.packet,
            payload.k,
            payload.indexer,
            payload.reranker,
            payload.output_hash.as_deref().unwrap_or("-")
        ),
    );
    for warning in &payload.warnings {
        output::line("query", format!("warning={warning}"));
    }
    for (i, hit) in payload.results.iter().enumerate() {
        let path = hit
            .metadata
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let text = hit.text.replace('\n', " ");
        let text: String = text.chars().take(160).collect();
        println!(
            "[{}] score={:.8} id={} path={path} text={text}",
            i + 1,
            hit.score,
            hit.id
        );
    }
    if let Some(context) = &payload.compiled_context {
        output::line(
            "query",
            format!(
                "context tokens={} snippets={}",
                context.token_estimate,
                context.core_snippets.len()
            ),
        );
    }
}
