//! `cpm doctor` - environment checks.

use std::process::Command;

use cpm_core::policy::load_policy;

use crate::app::CpmApp;
use crate::config::{CliConfig, EmbeddingsConfig};
use crate::output;

struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

pub fn run(app: &CpmApp) -> i32 {
    let mut checks = Vec::new();

    checks.push(Check {
        name: "workspace",
        ok: app.layout.root.is_dir(),
        detail: app.layout.root.display().to_string(),
    });

    let oras = Command::new("oras").arg("version").output();
    checks.push(match oras {
        Ok(out) if out.status.success() => Check {
            name: "oras",
            ok: true,
            detail: String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .unwrap_or("available")
                .to_string(),
        },
        _ => Check {
            name: "oras",
            ok: false,
            detail: "oras CLI not found on PATH (required for install/publish via OCI)".to_string(),
        },
    });

    let embeddings = EmbeddingsConfig::load(&app.layout);
    match embeddings.default_provider() {
        Some((name, _)) => {
            let reachable = app
                .embedder(None, None)
                .map(|e| e.health())
                .unwrap_or(false);
            checks.push(Check {
                name: "embedding provider",
                ok: reachable,
                detail: if reachable {
                    format!("default '{name}' reachable")
                } else {
                    format!("default '{name}' configured but unreachable")
                },
            });
        }
        None => checks.push(Check {
            name: "embedding provider",
            ok: false,
            detail: "none configured; `cpm embed add <name> --url <url> --set-default`".to_string(),
        }),
    }

    let config = CliConfig::load(&app.layout);
    checks.push(Check {
        name: "oci repository",
        ok: config.oci.repository.is_some(),
        detail: config
            .oci
            .repository
            .clone()
            .unwrap_or_else(|| "not configured".to_string()),
    });

    let policy = load_policy(&app.layout.root);
    checks.push(Check {
        name: "policy",
        ok: true,
        detail: format!(
            "mode={:?} allowed_sources={} min_trust={}",
            policy.mode,
            policy.allowed_sources.len(),
            policy.min_trust_score
        ),
    });

    let failing = checks.iter().filter(|c| !c.ok).count();
    for check in &checks {
        let mark = if check.ok { "ok " } else { "FAIL" };
        output::line("doctor", format!("[{mark}] {}: {}", check.name, check.detail));
    }
    output::line(
        "doctor",
        format!("{}/{} checks passed", checks.len() - failing, checks.len()),
    );
    // Doctor reports; it fails the exit code only when the workspace itself
    // is broken.
    i32::from(!checks[0].ok)
}
