//! Package housekeeping commands: `uninstall`, `use`, `prune`, `update`,
//! `list`, `list-remote`, `publish`.

use std::path::PathBuf;

use cpm_core::build::{archive_packet_dir, ArchiveFormat};
use cpm_core::version;
use cpm_registry::http::RegistryHttpClient;
use cpm_store::parse_package_spec;

use crate::app::CpmApp;
use crate::config::CliConfig;
use crate::output;

fn registry_client(app: &CpmApp) -> Result<RegistryHttpClient, String> {
    let config = CliConfig::load(&app.layout);
    let url = config
        .registry
        .url
        .ok_or("missing registry URL. Set [registry].url in config.toml")?;
    RegistryHttpClient::new(&url, config.registry.timeout_seconds.unwrap_or(10.0))
        .map_err(|e| e.to_string())
}

pub fn uninstall(app: &CpmApp, name: &str) -> i32 {
    if let Err(e) = app.store.remove(name) {
        output::error_line("uninstall", e.to_string(), None);
        return 1;
    }
    let lock_path = app.layout.install_dir().join(format!("{name}.lock.json"));
    if lock_path.exists() {
        let _ = std::fs::remove_file(&lock_path);
    }
    output::line("uninstall", format!("removed {name}"));
    0
}

pub fn use_version(app: &CpmApp, spec: &str) -> i32 {
    let (name, target) = parse_package_spec(spec);
    if name.is_empty() {
        output::error_line("use", "package name is required", None);
        return 1;
    }

    // `@latest` consults the registry so a stale local tree is visible.
    if target.as_deref().map(|t| t.eq_ignore_ascii_case("latest")) == Some(true) {
        match registry_client(app) {
            Ok(client) => match client.list_versions(&name) {
                Ok(remote) => {
                    let installed = app.store.installed_versions(&name).unwrap_or_default();
                    let local_latest = installed.last().cloned();
                    let remote_latest = remote
                        .iter()
                        .map(|v| v.version.clone())
                        .max_by(|a, b| version::compare(a, b));
                    if let (Some(local), Some(remote)) = (&local_latest, &remote_latest) {
                        if version::compare(remote, local) == std::cmp::Ordering::Greater {
                            output::line(
                                "use",
                                format!(
                                    "newer version {remote} is published; run `cpm update {name}` to fetch it"
                                ),
                            );
                        }
                    }
                }
                Err(e) => output::line("use", format!("registry check skipped: {e}")),
            },
            Err(message) => output::line("use", format!("registry check skipped: {message}")),
        }
    }

    match app.store.use_version(&name, target.as_deref()) {
        Ok(resolved) => {
            output::line("use", format!("{name}@{resolved} pinned and active"));
            0
        }
        Err(e) => {
            output::error_line("use", e.to_string(), Some("see installed versions with `cpm list`"));
            1
        }
    }
}

pub fn prune(app: &CpmApp, name: &str, keep: usize) -> i32 {
    match app.store.prune(name, keep) {
        Ok(removed) if removed.is_empty() => {
            output::line("prune", "nothing to remove");
            0
        }
        Ok(removed) => {
            output::line("prune", format!("removed {}", removed.join(", ")));
            0
        }
        Err(e) => {
            output::error_line("prune", e.to_string(), None);
            1
        }
    }
}

pub fn update(app: &CpmApp, name: &str) -> i32 {
    let client = match registry_client(app) {
        Ok(client) => client,
        Err(message) => {
            output::error_line("update", message, None);
            return 1;
        }
    };
    let remote = match client.list_versions(name) {
        Ok(remote) => remote,
        Err(e) => {
            output::error_line("update", e.to_string(), None);
            return 1;
        }
    };
    let Some(remote_latest) = remote
        .iter()
        .map(|v| v.version.clone())
        .max_by(|a, b| version::compare(a, b))
    else {
        output::error_line("update", format!("{name} is not published"), None);
        return 1;
    };

    let installed = app.store.installed_versions(name).unwrap_or_default();
    if let Some(local_latest) = installed.last() {
        if version::compare(&remote_latest, local_latest) != std::cmp::Ordering::Greater {
            output::line("update", format!("{name}@{local_latest} is up to date"));
            return 0;
        }
    }

    // Download the archive and unpack it into the store.
    let archive_path = app
        .layout
        .cache_dir()
        .join("downloads")
        .join(format!("{name}-{remote_latest}.tar.gz"));
    if let Err(e) = client.download(name, &remote_latest, &archive_path) {
        output::error_line("update", e.to_string(), None);
        return 1;
    }
    let target_dir = match app.store.layout().version_dir(name, &remote_latest) {
        Ok(dir) => dir,
        Err(e) => {
            output::error_line("update", e.to_string(), None);
            return 1;
        }
    };
    if let Err(message) = extract_tar_gz(&archive_path, &target_dir) {
        output::error_line("update", message, None);
        return 1;
    }
    if let Err(e) = app.store.use_version(name, Some(&remote_latest)) {
        output::error_line("update", e.to_string(), None);
        return 1;
    }
    output::line("update", format!("installed {name}@{remote_latest}"));
    0
}

/// Unpack an archive whose single top-level entry is the packet directory.
fn extract_tar_gz(archive_path: &PathBuf, target_dir: &PathBuf) -> Result<(), String> {
    let file = std::fs::File::open(archive_path).map_err(|e| e.to_string())?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

    let scratch = target_dir.with_extension("unpack");
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch).map_err(|e| e.to_string())?;
    }
    std::fs::create_dir_all(&scratch).map_err(|e| e.to_string())?;
    // tar's unpack already refuses entries escaping the destination.
    archive.unpack(&scratch).map_err(|e| e.to_string())?;

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&scratch)
        .map_err(|e| e.to_string())?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    let source = match entries.as_slice() {
        [single] if single.is_dir() => single.clone(),
        _ => scratch.clone(),
    };

    if target_dir.exists() {
        std::fs::remove_dir_all(target_dir).map_err(|e| e.to_string())?;
    }
    if let Some(parent) = target_dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::rename(&source, target_dir).map_err(|e| e.to_string())?;
    let _ = std::fs::remove_dir_all(&scratch);
    Ok(())
}

pub fn list(app: &CpmApp) -> i32 {
    let packages = match app.store.list_packages() {
        Ok(packages) => packages,
        Err(e) => {
            output::error_line("list", e.to_string(), None);
            return 1;
        }
    };
    if output::is_json() {
        let _ = output::print_json(&packages);
        return 0;
    }
    if packages.is_empty() {
        output::line("list", "no packets installed");
        return 0;
    }
    for package in packages {
        let mut tags = Vec::new();
        if let Some(pin) = &package.pinned_version {
            tags.push(format!("pin={pin}"));
        }
        if let Some(active) = &package.active_version {
            tags.push(format!("active={active}"));
        }
        output::line(
            "list",
            format!(
                "{} versions=[{}] {}",
                package.name,
                package.versions.join(", "),
                tags.join(" ")
            ),
        );
    }
    0
}

pub fn list_remote(app: &CpmApp, name: &str) -> i32 {
    let client = match registry_client(app) {
        Ok(client) => client,
        Err(message) => {
            output::error_line("list-remote", message, None);
            return 1;
        }
    };
    match client.list_versions(name) {
        Ok(versions) if versions.is_empty() => {
            output::line("list-remote", format!("{name} has no published versions"));
            0
        }
        Ok(mut versions) => {
            versions.sort_by(|a, b| version::compare(&a.version, &b.version));
            for v in versions {
                output::line(
                    "list-remote",
                    format!(
                        "{name}@{} {}",
                        v.version,
                        v.published_at.as_deref().unwrap_or("")
                    ),
                );
            }
            0
        }
        Err(e) => {
            output::error_line("list-remote", e.to_string(), None);
            1
        }
    }
}

pub fn publish(app: &CpmApp, spec: &str, registry_override: Option<&str>) -> i32 {
    let (name, version_str) = parse_package_spec(spec);
    let Some(version_str) = version_str else {
        output::error_line("publish", "version is required (use name@version)", None);
        return 1;
    };

    let packet_dir = match app.store.layout().version_dir(&name, &version_str) {
        Ok(dir) if dir.exists() => dir,
        Ok(dir) => {
            output::error_line(
                "publish",
                format!("packet not found at {}", dir.display()),
                Some("build or install it first"),
            );
            return 1;
        }
        Err(e) => {
            output::error_line("publish", e.to_string(), None);
            return 1;
        }
    };

    let archive = match archive_packet_dir(&packet_dir, ArchiveFormat::TarGz) {
        Ok(path) => path,
        Err(e) => {
            output::error_line("publish", e.to_string(), None);
            return 1;
        }
    };

    let client = match registry_override {
        Some(url) => match RegistryHttpClient::new(url, 30.0) {
            Ok(client) => client,
            Err(e) => {
                output::error_line("publish", e.to_string(), None);
                return 1;
            }
        },
        None => match registry_client(app) {
            Ok(client) => client,
            Err(message) => {
                output::error_line("publish", message, None);
                return 1;
            }
        },
    };
    match client.publish(&name, &version_str, &archive) {
        Ok(()) => {
            output::line("publish", format!("published {name}@{version_str}"));
            0
        }
        Err(e) => {
            output::error_line("publish", e.to_string(), None);
            1
        }
    }
}
