//! `cpm benchmark` - run a query set against a packet and gate on KPIs.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use cpm_core::retrieve::RetrievalRequest;

use crate::app::CpmApp;
use crate::args::BenchmarkArgs;
use crate::cmd::query::resolve_packet_dir;
use crate::output;

#[derive(Debug, Serialize)]
struct QueryStats {
    query: String,
    ok: bool,
    top_score: Option<f32>,
    snippets: usize,
    cited_snippets: usize,
    latency_ms: u128,
}

#[derive(Debug, Serialize)]
struct BenchmarkReport {
    packet: String,
    generated_at: String,
    queries: Vec<QueryStats>,
    citation_coverage: f64,
    mean_top_score: f64,
    failed_queries: usize,
    gates: Vec<String>,
    ok: bool,
}

pub fn run(app: &CpmApp, args: BenchmarkArgs) -> i32 {
    let queries: Vec<String> = match std::fs::read_to_string(&args.queries)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
    {
        Ok(queries) => queries,
        Err(e) => {
            output::error_line("benchmark", format!("unable to read query set: {e}"), None);
            return 1;
        }
    };
    if queries.is_empty() {
        output::error_line("benchmark", "query set is empty", None);
        return 1;
    }

    let (packet_dir, _) = match resolve_packet_dir(app, &args.packet, None) {
        Ok(resolved) => resolved,
        Err(e) => {
            output::error_line("benchmark", e.to_string(), None);
            return 1;
        }
    };
    let (_, retriever) = match app.resolve_retriever(None, None) {
        Ok(resolved) => resolved,
        Err(e) => {
            output::error_line("benchmark", e.to_string(), None);
            return 1;
        }
    };
    let embedder = match app.embedder(args.embed_url.as_deref(), None) {
        Ok(embedder) => embedder,
        Err(e) => {
            output::error_line("benchmark", e.to_string(), None);
            return 1;
        }
    };

    let mut stats = Vec::new();
    let mut total_snippets = 0usize;
    let mut cited_snippets = 0usize;
    let mut score_sum = 0.0f64;
    let mut scored = 0usize;
    let mut failed = 0usize;

    for query in &queries {
        let request = RetrievalRequest::new(&args.packet, query, args.k);
        let started = Instant::now();
        let payload = retriever.retrieve(&packet_dir, &request, embedder.as_ref());
        let latency_ms = started.elapsed().as_millis();

        let top_score = payload.results.first().map(|h| h.score);
        let (snippets, cited) = payload
            .compiled_context
            .as_ref()
            .map(|c| {
                (
                    c.core_snippets.len(),
                    c.core_snippets
                        .iter()
                        .filter(|s| !s.citation.trim().is_empty())
                        .count(),
                )
            })
            .unwrap_or((0, 0));
        total_snippets += snippets;
        cited_snippets += cited;
        if let Some(score) = top_score {
            score_sum += f64::from(score);
            scored += 1;
        }
        if !payload.ok {
            failed += 1;
        }
        stats.push(QueryStats {
            query: query.clone(),
            ok: payload.ok,
            top_score,
            snippets,
            cited_snippets: cited,
            latency_ms,
        });
    }

    let citation_coverage = if total_snippets == 0 {
        0.0
    } else {
        cited_snippets as f64 / total_snippets as f64
    };
    let mean_top_score = if scored == 0 { 0.0 } else { score_sum / scored as f64 };

    let mut gates = Vec::new();
    if failed > 0 {
        gates.push(format!("{failed} queries failed"));
    }
    if citation_coverage < args.min_citation_coverage {
        gates.push(format!(
            "citation coverage {citation_coverage:.3} below minimum {:.3}",
            args.min_citation_coverage
        ));
    }
    if let Some(min_score) = args.min_top_score {
        if mean_top_score < min_score {
            gates.push(format!(
                "mean top score {mean_top_score:.4} below minimum {min_score:.4}"
            ));
        }
    }

    let report = BenchmarkReport {
        packet: args.packet.clone(),
        generated_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        queries: stats,
        citation_coverage,
        mean_top_score,
        failed_queries: failed,
        ok: gates.is_empty(),
        gates,
    };

    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let report_path = app
        .layout
        .benchmarks_dir()
        .join(format!("benchmark-{stamp}.json"));
    if let Err(e) = std::fs::create_dir_all(app.layout.benchmarks_dir())
        .map_err(|e| e.to_string())
        .and_then(|_| serde_json::to_string_pretty(&report).map_err(|e| e.to_string()))
        .and_then(|body| std::fs::write(&report_path, body).map_err(|e| e.to_string()))
    {
        output::error_line("benchmark", format!("unable to write report: {e}"), None);
        return 1;
    }

    if output::is_json() {
        let _ = output::print_json(&report);
    } else {
        output::line(
            "benchmark",
            format!(
                "queries={} coverage={citation_coverage:.3} mean_top_score={mean_top_score:.4}",
                report.queries.len()
            ),
        );
        output::line("benchmark", format!("report={}", report_path.display()));
        for gate in &report.gates {
            output::error_line("benchmark", format!("gate failed: {gate}"), None);
        }
    }
    i32::from(!report.ok)
}
