//! Workspace directory layout.
//!
//! A workspace root (default `.cpm`) contains:
//! ```text
//! packages/<name>/<version-segments>/...
//! cache/{embeddings,models,objects}
//! plugins/<plugin_id>/plugin.toml
//! state/{pins,active,install,install/history,benchmarks}
//! config/{config.toml,embeddings.yml,build.toml}
//! logs/
//! ```
//! The dotted-segments layout is the only supported packet layout: version
//! `1.2.0` lives at `packages/<name>/1/2/0/`.

use std::path::{Path, PathBuf};

use cpm_core::errors::CpmResult;
use cpm_core::version;

/// Default workspace directory name under a project root.
pub const DEFAULT_WORKSPACE_NAME: &str = ".cpm";

/// Resolved workspace directory tree.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walk up from `start` looking for an existing workspace directory.
    pub fn discover(start: &Path) -> Option<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            let candidate = dir.join(DEFAULT_WORKSPACE_NAME);
            if candidate.is_dir() {
                return Some(Self::new(candidate));
            }
            current = dir.parent();
        }
        None
    }

    /// Existing workspace near `start`, or a fresh `.cpm` under it.
    pub fn discover_or_default(start: &Path) -> Self {
        Self::discover(start).unwrap_or_else(|| Self::new(start.join(DEFAULT_WORKSPACE_NAME)))
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn embeddings_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("embeddings")
    }

    pub fn models_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("models")
    }

    pub fn objects_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("objects")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn pins_dir(&self) -> PathBuf {
        self.state_dir().join("pins")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.state_dir().join("active")
    }

    pub fn install_dir(&self) -> PathBuf {
        self.state_dir().join("install")
    }

    pub fn install_history_dir(&self, name: &str) -> PathBuf {
        self.install_dir().join("history").join(name)
    }

    pub fn benchmarks_dir(&self) -> PathBuf {
        self.state_dir().join("benchmarks")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    pub fn embeddings_file(&self) -> PathBuf {
        self.config_dir().join("embeddings.yml")
    }

    pub fn build_config_file(&self) -> PathBuf {
        self.config_dir().join("build.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Packet directory for `name@version` using dotted version segments.
    pub fn version_dir(&self, name: &str, version_str: &str) -> CpmResult<PathBuf> {
        let mut dir = self.packages_dir().join(name);
        for part in version::parts(version_str)? {
            dir = dir.join(part);
        }
        Ok(dir)
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> CpmResult<()> {
        for dir in [
            self.root.clone(),
            self.packages_dir(),
            self.embeddings_cache_dir(),
            self.models_cache_dir(),
            self.objects_cache_dir(),
            self.plugins_dir(),
            self.pins_dir(),
            self.active_dir(),
            self.install_dir(),
            self.benchmarks_dir(),
            self.config_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_dir_uses_dotted_segments() {
        let layout = WorkspaceLayout::new("/ws/.cpm");
        let dir = layout.version_dir("docs", "1.2.0").unwrap();
        assert_eq!(dir, PathBuf::from("/ws/.cpm/packages/docs/1/2/0"));
        let dir = layout.version_dir("docs", "1.2.0-rc1").unwrap();
        assert_eq!(dir, PathBuf::from("/ws/.cpm/packages/docs/1/2/0-rc1"));
    }

    #[test]
    fn discover_walks_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join(".cpm");
        std::fs::create_dir_all(&ws).unwrap();
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = WorkspaceLayout::discover(&nested).unwrap();
        assert_eq!(found.root, ws);
    }

    #[test]
    fn ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path().join(".cpm"));
        layout.ensure().unwrap();
        assert!(layout.pins_dir().is_dir());
        assert!(layout.objects_cache_dir().is_dir());
        assert!(layout.benchmarks_dir().is_dir());
    }
}
