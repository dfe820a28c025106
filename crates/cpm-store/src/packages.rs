//! Versioned packet store: enumeration, pins, active markers, resolution,
//! pruning and removal.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::version;

use crate::layout::WorkspaceLayout;

/// `{name, version}` marker stored in pins/active files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionMarker {
    name: String,
    version: String,
}

/// One installed package with its state.
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub versions: Vec<String>,
    pub pinned_version: Option<String>,
    pub active_version: Option<String>,
}

/// Store operations over a workspace layout.
pub struct PackageStore {
    layout: WorkspaceLayout,
}

impl PackageStore {
    pub fn new(layout: WorkspaceLayout) -> CpmResult<Self> {
        layout.ensure()?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// All packages that have at least one installed version.
    pub fn list_packages(&self) -> CpmResult<Vec<PackageSummary>> {
        let packages_dir = self.layout.packages_dir();
        if !packages_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&packages_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();

        let mut out = Vec::new();
        for name in names {
            let versions = self.installed_versions(&name)?;
            if versions.is_empty() {
                continue;
            }
            out.push(PackageSummary {
                pinned_version: self.pinned_version(&name),
                active_version: self.active_version(&name),
                name,
                versions,
            });
        }
        Ok(out)
    }

    /// Installed versions of a package, sorted ascending by version order.
    ///
    /// A version counts as installed when a `cpm.yml` with a non-empty
    /// `version` exists somewhere under `packages/<name>/`.
    pub fn installed_versions(&self, name: &str) -> CpmResult<Vec<String>> {
        let root = self.layout.packages_dir().join(name);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut found: BTreeSet<String> = BTreeSet::new();
        for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| CpmError::io(format!("walk {}: {e}", root.display())))?;
            if !entry.file_type().is_file() || entry.file_name() != "cpm.yml" {
                continue;
            }
            if let Ok(info) = cpm_core::packet::io::load_packet_info(entry.path()) {
                let v = info.version.trim().to_string();
                if !v.is_empty() {
                    found.insert(v);
                }
            }
        }
        let mut versions: Vec<String> = found.into_iter().collect();
        versions.sort_by(|a, b| version::compare(a, b));
        Ok(versions)
    }

    // ------------------------- pins / active -------------------------

    fn pin_path(&self, name: &str) -> PathBuf {
        self.layout.pins_dir().join(format!("{name}.yml"))
    }

    fn active_path(&self, name: &str) -> PathBuf {
        self.layout.active_dir().join(format!("{name}.yml"))
    }

    fn read_marker(&self, path: &PathBuf) -> Option<String> {
        let raw = std::fs::read_to_string(path).ok()?;
        let marker: VersionMarker = serde_yaml::from_str(&raw).ok()?;
        let v = marker.version.trim().to_string();
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    }

    fn write_marker(&self, path: &PathBuf, name: &str, version_str: &str) -> CpmResult<()> {
        version::parts(version_str)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let marker = VersionMarker {
            name: name.to_string(),
            version: version_str.to_string(),
        };
        std::fs::write(path, serde_yaml::to_string(&marker).map_err(CpmError::from)?)?;
        Ok(())
    }

    pub fn pinned_version(&self, name: &str) -> Option<String> {
        self.read_marker(&self.pin_path(name))
    }

    pub fn set_pinned_version(&self, name: &str, version_str: &str) -> CpmResult<()> {
        self.write_marker(&self.pin_path(name), name, version_str)
    }

    pub fn active_version(&self, name: &str) -> Option<String> {
        self.read_marker(&self.active_path(name))
    }

    pub fn set_active_version(&self, name: &str, version_str: &str) -> CpmResult<()> {
        self.write_marker(&self.active_path(name), name, version_str)
    }

    // --------------------------- resolution --------------------------

    /// Resolve a version request against installed versions.
    ///
    /// - `None` -> pin if present and installed, else greatest installed
    /// - `Some("latest")` -> greatest installed
    /// - explicit version -> must be installed
    pub fn resolve_version(&self, name: &str, target: Option<&str>) -> CpmResult<String> {
        let versions = self.installed_versions(name)?;
        if versions.is_empty() {
            return Err(CpmError::not_installed(format!(
                "no versions installed for {name}"
            )));
        }
        match version::normalize_latest(target) {
            None => {
                if let Some(pinned) = self.pinned_version(name) {
                    if versions.contains(&pinned) {
                        return Ok(pinned);
                    }
                }
                Ok(self.greatest(&versions))
            }
            Some(candidate) if candidate == "latest" => Ok(self.greatest(&versions)),
            Some(candidate) => {
                if versions.contains(&candidate) {
                    Ok(candidate)
                } else {
                    Err(CpmError::version_not_found(format!(
                        "version {candidate} is not installed for {name}"
                    )))
                }
            }
        }
    }

    /// Resolved packet directory; errors when the directory vanished.
    pub fn resolve_packet_dir(&self, name: &str, target: Option<&str>) -> CpmResult<PathBuf> {
        let resolved = self.resolve_version(name, target)?;
        let dir = self.layout.version_dir(name, &resolved)?;
        if !dir.exists() {
            return Err(CpmError::packet_not_found(format!(
                "packet directory missing for {name}@{resolved}: {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    fn greatest(&self, versions: &[String]) -> String {
        versions
            .iter()
            .max_by(|a, b| version::compare(a, b))
            .cloned()
            .unwrap_or_default()
    }

    /// Pin + activate a version (the `use` operation).
    pub fn use_version(&self, name: &str, target: Option<&str>) -> CpmResult<String> {
        let resolved = self.resolve_version(name, target)?;
        self.set_pinned_version(name, &resolved)?;
        self.set_active_version(name, &resolved)?;
        Ok(resolved)
    }

    // -------------------------- housekeeping -------------------------

    /// Remove old versions, keeping the `keep` most recent plus whatever is
    /// pinned or active. Returns the removed versions.
    pub fn prune(&self, name: &str, keep: usize) -> CpmResult<Vec<String>> {
        if keep < 1 {
            return Err(CpmError::invalid_spec("keep must be >= 1"));
        }
        let versions = self.installed_versions(name)?;
        if versions.is_empty() {
            return Ok(Vec::new());
        }
        let mut keep_set: BTreeSet<String> = versions
            .iter()
            .rev()
            .take(keep)
            .cloned()
            .collect();
        if let Some(pinned) = self.pinned_version(name) {
            keep_set.insert(pinned);
        }
        if let Some(active) = self.active_version(name) {
            keep_set.insert(active);
        }

        let mut removed = Vec::new();
        for v in versions {
            if keep_set.contains(&v) {
                continue;
            }
            let dir = self.layout.version_dir(name, &v)?;
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            removed.push(v);
        }
        Ok(removed)
    }

    /// Remove a package tree plus its pin and active markers.
    pub fn remove(&self, name: &str) -> CpmResult<()> {
        let root = self.layout.packages_dir().join(name);
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        for path in [self.pin_path(name), self.active_path(name)] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Split `name[@version]`; an empty version after `@` maps to `None`.
pub fn parse_package_spec(spec: &str) -> (String, Option<String>) {
    match spec.split_once('@') {
        None => (spec.trim().to_string(), None),
        Some((name, version_str)) => {
            let v = version_str.trim();
            (
                name.trim().to_string(),
                if v.is_empty() { None } else { Some(v.to_string()) },
            )
        }
    }
}

/// Compare two versions (re-exported for command surfaces).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version::compare(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpm_core::model::PacketInfo;
    use cpm_core::packet::io::write_packet_info;

    fn install(store: &PackageStore, name: &str, version_str: &str) {
        let dir = store.layout().version_dir(name, version_str).unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        let info = PacketInfo {
            cpm_schema: 1,
            name: name.to_string(),
            version: version_str.to_string(),
            description: String::new(),
            tags: vec![],
            entrypoints: vec!["query".to_string()],
            embedding_model: "m".to_string(),
            embedding_dim: 4,
            embedding_normalized: true,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        };
        write_packet_info(&info, &dir.join("cpm.yml")).unwrap();
    }

    fn store() -> (tempfile::TempDir, PackageStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = PackageStore::new(WorkspaceLayout::new(tmp.path().join(".cpm"))).unwrap();
        (tmp, store)
    }

    #[test]
    fn resolution_rules() {
        let (_tmp, store) = store();
        for v in ["0.9.0", "1.0.0", "1.1.0", "1.2.0"] {
            install(&store, "docs", v);
        }
        store.set_pinned_version("docs", "1.1.0").unwrap();

        assert_eq!(store.resolve_version("docs", None).unwrap(), "1.1.0");
        assert_eq!(store.resolve_version("docs", Some("latest")).unwrap(), "1.2.0");
        assert_eq!(store.resolve_version("docs", Some("1.0.0")).unwrap(), "1.0.0");

        let err = store.resolve_version("docs", Some("9.9.9")).unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::VersionNotFound);
        let err = store.resolve_version("missing", None).unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::NotInstalled);
    }

    #[test]
    fn prune_keeps_pin_and_active() {
        let (_tmp, store) = store();
        for v in ["0.9.0", "1.0.0", "1.1.0", "1.2.0"] {
            install(&store, "docs", v);
        }
        store.set_pinned_version("docs", "1.1.0").unwrap();
        store.set_active_version("docs", "0.9.0").unwrap();

        let removed = store.prune("docs", 1).unwrap();
        assert_eq!(removed, vec!["1.0.0".to_string()]);
        assert_eq!(
            store.installed_versions("docs").unwrap(),
            vec!["0.9.0", "1.1.0", "1.2.0"]
        );
    }

    #[test]
    fn use_sets_pin_and_active() {
        let (_tmp, store) = store();
        install(&store, "docs", "1.0.0");
        install(&store, "docs", "1.2.0");
        let resolved = store.use_version("docs", Some("latest")).unwrap();
        assert_eq!(resolved, "1.2.0");
        assert_eq!(store.pinned_version("docs").as_deref(), Some("1.2.0"));
        assert_eq!(store.active_version("docs").as_deref(), Some("1.2.0"));
    }

    #[test]
    fn remove_clears_markers() {
        let (_tmp, store) = store();
        install(&store, "docs", "1.0.0");
        store.use_version("docs", None).unwrap();
        store.remove("docs").unwrap();
        assert!(store.installed_versions("docs").unwrap().is_empty());
        assert!(store.pinned_version("docs").is_none());
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(parse_package_spec("docs"), ("docs".to_string(), None));
        assert_eq!(
            parse_package_spec("docs@1.2.0"),
            ("docs".to_string(), Some("1.2.0".to_string()))
        );
        assert_eq!(parse_package_spec("docs@"), ("docs".to_string(), None));
    }

    #[test]
    fn qualifier_versions_sort_into_place() {
        let (_tmp, store) = store();
        for v in ["1.2.0", "1.2.0-rc1", "1.2.0-final"] {
            install(&store, "docs", v);
        }
        assert_eq!(
            store.installed_versions("docs").unwrap(),
            vec!["1.2.0-rc1", "1.2.0", "1.2.0-final"]
        );
        assert_eq!(
            store.resolve_version("docs", Some("latest")).unwrap(),
            "1.2.0-final"
        );
    }
}
