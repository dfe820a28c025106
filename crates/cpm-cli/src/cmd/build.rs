//! `cpm build run|verify|lock`.

use std::path::PathBuf;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};

use cpm_core::build::{build_packet, ArchiveFormat, BuildRequest, BuilderConfig};
use cpm_core::errors::ErrorKind;
use cpm_core::lockfile::{
    artifact_hashes, load_lock, render_lock, verify_artifacts, verify_lock_against_plan,
};
use cpm_core::{files, lockfile};

use crate::app::CpmApp;
use crate::args::{BuildAction, BuildArgs};
use crate::config::BuildFileConfig;
use crate::output;

pub fn run(app: &CpmApp, action: BuildAction) -> i32 {
    match action {
        BuildAction::Run(args) => run_build(app, args),
        BuildAction::Verify { packet_dir, source } => verify(app, packet_dir, source),
        BuildAction::Lock {
            packet_dir,
            source,
            update_lock,
        } => relock(app, packet_dir, source, update_lock),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn run_build(app: &CpmApp, args: BuildArgs) -> i32 {
    let file = BuildFileConfig::load(&app.layout);
    let Some(source_dir) = args.source.or_else(|| file.source.dir.clone()).map(PathBuf::from)
    else {
        output::error_line(
            "build",
            "missing source directory: pass --source or set [source].dir in build.toml",
            None,
        );
        return 1;
    };

    let mut config = match file.builder_config() {
        Ok(config) => config,
        Err(e) => {
            output::error_line("build", e.to_string(), None);
            return 1;
        }
    };
    if let Some(model) = args.model {
        config.model_name = model;
    }
    if let Some(url) = args.embed_url {
        config.embed_url = url;
    }
    if let Some(version) = args.packet_version {
        config.version = version;
    }
    if args.archive {
        config.archive = true;
    }
    if let Some(format) = args.archive_format {
        match ArchiveFormat::parse(&format) {
            Ok(parsed) => config.archive_format = parsed,
            Err(e) => {
                output::error_line("build", e.to_string(), None);
                return 1;
            }
        }
    }
    config.update_lock = args.update_lock;

    let name = args
        .name
        .or_else(|| {
            args.out
                .as_ref()
                .map(PathBuf::from)
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        })
        .or_else(|| {
            source_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "packet".to_string());

    // Without an explicit output directory the packet lands in the store.
    let packet_dir = match args.out.or_else(|| file.output.dir.clone()) {
        Some(out) => PathBuf::from(out),
        None => match app.store.layout().version_dir(&name, &config.version) {
            Ok(dir) => dir,
            Err(e) => {
                output::error_line("build", e.to_string(), None);
                return 1;
            }
        },
    };
    let request = BuildRequest {
        source_dir: source_dir.clone(),
        packet_dir: packet_dir.clone(),
        name,
        description: source_dir.to_string_lossy().replace('\\', "/"),
        generated_at: now_rfc3339(),
        cpm_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let embedder = match app.embedder(Some(&config.embed_url), None) {
        Ok(embedder) => embedder,
        Err(e) => {
            output::error_line("build", e.to_string(), None);
            return 1;
        }
    };

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message("building packet");

    let result = build_packet(&request, &config, embedder.as_ref());
    spinner.finish_and_clear();

    match result {
        Ok(report) => {
            output::line(
                "build",
                format!(
                    "ok chunks={} reused={} embedded={} removed={} dim={}",
                    report.chunk_count,
                    report.reused,
                    report.embedded,
                    report.removed,
                    report.manifest.embedding.dim
                ),
            );
            if let Some(archive) = report.archive_path {
                output::line("build", format!("archive={}", archive.display()));
            }
            0
        }
        Err(e) => {
            let hint = match e.kind {
                ErrorKind::EmbedUnreachable => Some(
                    "configure an embedding provider with `cpm embed add ... --set-default` or start the pool with `cpm pool serve`",
                ),
                ErrorKind::LockMismatch => Some("pass --update-lock to accept input drift"),
                _ => None,
            };
            output::error_line("build", e.to_string(), hint);
            1
        }
    }
}

fn plan_from_configs(
    app: &CpmApp,
    packet_dir: &PathBuf,
    source: Option<String>,
) -> Result<(lockfile::ResolvedPlan, PathBuf), String> {
    let file = BuildFileConfig::load(&app.layout);
    let source_dir = source
        .or_else(|| file.source.dir.clone())
        .ok_or("missing source directory: pass --source or set [source].dir in build.toml")?;
    let source_dir = PathBuf::from(source_dir);
    let config: BuilderConfig = file.builder_config().map_err(|e| e.to_string())?;

    let name = packet_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "packet".to_string());
    let request = BuildRequest {
        source_dir,
        packet_dir: packet_dir.clone(),
        name,
        description: String::new(),
        generated_at: now_rfc3339(),
        cpm_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    cpm_core::build::plan_for(&request, &config)
        .map(|plan| (plan, packet_dir.clone()))
        .map_err(|e| e.to_string())
}

fn packet_dir_arg(app: &CpmApp, packet_dir: Option<String>) -> Result<PathBuf, String> {
    let file = BuildFileConfig::load(&app.layout);
    packet_dir
        .or_else(|| file.output.dir.clone())
        .map(PathBuf::from)
        .ok_or_else(|| {
            "missing packet directory: pass --packet-dir or set [output].dir in build.toml"
                .to_string()
        })
}

fn verify(app: &CpmApp, packet_dir: Option<String>, source: Option<String>) -> i32 {
    let packet_dir = match packet_dir_arg(app, packet_dir) {
        Ok(dir) => dir,
        Err(message) => {
            output::error_line("build", message, None);
            return 1;
        }
    };
    let lock_path = packet_dir.join(files::LOCKFILE);
    let lock = match load_lock(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            output::error_line("build", format!("verify failed: {e}"), None);
            return 1;
        }
    };

    let mut failed = false;
    match plan_from_configs(app, &packet_dir, source) {
        Ok((plan, _)) => {
            let verdict = verify_lock_against_plan(&lock, &plan);
            if !verdict.ok {
                failed = true;
                for error in &verdict.errors {
                    output::line("build", format!("plan mismatch: {error}"));
                }
            }
        }
        Err(message) => {
            output::line("build", format!("plan not verified: {message}"));
        }
    }

    match verify_artifacts(&lock, &packet_dir) {
        Ok(verdict) if verdict.ok => {}
        Ok(verdict) => {
            failed = true;
            for error in &verdict.errors {
                output::line("build", format!("artifact mismatch: {error}"));
            }
        }
        Err(e) => {
            failed = true;
            output::line("build", format!("artifact verification failed: {e}"));
        }
    }

    if failed {
        output::error_line("build", "verify failed", Some("run `cpm build lock --update-lock` after an intentional change"));
        1
    } else {
        output::line("build", "verify ok");
        0
    }
}

fn relock(
    app: &CpmApp,
    packet_dir: Option<String>,
    source: Option<String>,
    update_lock: bool,
) -> i32 {
    if !update_lock {
        output::error_line("build", "refusing to rewrite the lockfile", Some("pass --update-lock"));
        return 1;
    }
    let packet_dir = match packet_dir_arg(app, packet_dir) {
        Ok(dir) => dir,
        Err(message) => {
            output::error_line("build", message, None);
            return 1;
        }
    };
    let (plan, _) = match plan_from_configs(app, &packet_dir, source) {
        Ok(plan) => plan,
        Err(message) => {
            output::error_line("build", message, None);
            return 1;
        }
    };
    let artifacts = match artifact_hashes(&packet_dir) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            output::error_line("build", e.to_string(), None);
            return 1;
        }
    };
    let lock = render_lock(&plan, artifacts, &now_rfc3339(), env!("CARGO_PKG_VERSION"));
    match lockfile::write_lock(&lock, &packet_dir.join(files::LOCKFILE)) {
        Ok(()) => {
            output::line("build", "lockfile regenerated");
            0
        }
        Err(e) => {
            output::error_line("build", e.to_string(), None);
            1
        }
    }
}
