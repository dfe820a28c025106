//! `cpm replay` - re-run a recorded query and verify its output hash.

use std::path::Path;

use serde_json::Value;

use cpm_core::retrieve::{RetrievalRequest, DEFAULT_INDEXER, DEFAULT_RERANKER};

use crate::app::CpmApp;
use crate::cmd::query::resolve_packet_dir;
use crate::output;

pub fn run(app: &CpmApp, log: &str) -> i32 {
    let log_path = Path::new(log);
    if !log_path.exists() {
        output::error_line("replay", format!("log not found: {log}"), None);
        return 1;
    }
    let payload: Value = match std::fs::read_to_string(log_path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
    {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            output::error_line("replay", "log payload must be an object", None);
            return 1;
        }
        Err(e) => {
            output::error_line("replay", format!("invalid log payload: {e}"), None);
            return 1;
        }
    };

    let expected_hash = payload
        .get("output_hash")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if expected_hash.is_empty() {
        output::error_line("replay", "log missing output_hash", None);
        return 1;
    }

    let field = |key: &str| payload.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let mut request = RetrievalRequest::new(field("packet"), field("query"), 5);
    if let Some(k) = payload.get("k").and_then(|v| v.as_u64()) {
        request.k = k as usize;
    }
    request.indexer = non_empty_or(field("indexer"), DEFAULT_INDEXER);
    request.reranker = non_empty_or(field("reranker"), DEFAULT_RERANKER);
    request.selected_model = payload
        .get("selected_model")
        .and_then(|v| v.as_str())
        .map(String::from)
        .filter(|m| !m.trim().is_empty());
    if let Some(budget) = payload
        .get("compiled_context")
        .and_then(|c| c.get("token_estimate"))
        .and_then(|v| v.as_u64())
    {
        // The recorded context fit this budget; the default is fine unless
        // the log captured a larger one.
        request.max_context_tokens = request.max_context_tokens.max(budget);
    }

    let (packet_dir, _) = match resolve_packet_dir(app, &request.packet.clone(), None) {
        Ok(resolved) => resolved,
        Err(e) => {
            output::error_line("replay", e.to_string(), None);
            return 1;
        }
    };

    let (_, retriever) = match app.resolve_retriever(Some("cpm:native-retriever"), None) {
        Ok(resolved) => resolved,
        Err(e) => {
            output::error_line("replay", format!("native retriever not available: {e}"), None);
            return 1;
        }
    };
    let embedder = match app.embedder(None, None) {
        Ok(embedder) => embedder,
        Err(e) => {
            output::error_line("replay", e.to_string(), None);
            return 1;
        }
    };

    let result = retriever.retrieve(&packet_dir, &request, embedder.as_ref());
    let Some(actual_hash) = result.output_hash else {
        output::error_line("replay", "replay did not produce an output hash", None);
        return 1;
    };

    let ok = actual_hash == expected_hash;
    output::line("replay", format!("expected={expected_hash}"));
    output::line("replay", format!("actual={actual_hash}"));
    output::line("replay", format!("status={}", if ok { "ok" } else { "mismatch" }));
    i32::from(!ok)
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
