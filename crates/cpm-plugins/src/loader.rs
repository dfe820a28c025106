//! Plugin discovery and loading.
//!
//! Discovery scans the workspace `plugins/` directory and then the user
//! plugins directory; the first manifest wins per plugin id. Entrypoints are
//! looked up in the host's constructor table (the plugin ABI for a
//! statically-linked host) and `init(context)` registers features explicitly
//! through the context. A failing plugin is isolated: its record turns
//! `failed` and any features it staged are rolled back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use cpm_core::errors::{CpmError, CpmResult};

use crate::events::EventBus;
use crate::manifest::PluginManifest;
use crate::registry::{FeatureEntry, FeatureKind, FeatureRegistry, FeatureTarget};

/// Where a plugin was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginSource {
    Builtin,
    Workspace,
    User,
}

impl PluginSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Workspace => "workspace",
            Self::User => "user",
        }
    }
}

/// Plugin lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginState {
    Pending,
    Ready,
    Failed,
}

/// One discovered plugin and its load outcome.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub id: String,
    pub manifest: PluginManifest,
    pub path: PathBuf,
    pub source: PluginSource,
    pub state: PluginState,
    pub features: Vec<String>,
    pub error: Option<String>,
}

/// Context handed to a plugin's `init`.
pub struct PluginContext<'a> {
    pub manifest: &'a PluginManifest,
    pub plugin_root: &'a Path,
    pub workspace_root: &'a Path,
    pub events: &'a EventBus,
    staged: Vec<FeatureEntry>,
}

impl<'a> PluginContext<'a> {
    /// Stage a feature for registration. The plugin's group and id are
    /// applied by the loader; plugins only choose name, kind and target.
    pub fn register_feature(
        &mut self,
        name: &str,
        kind: FeatureKind,
        target: FeatureTarget,
    ) -> CpmResult<()> {
        let entry = FeatureEntry::new(
            &self.manifest.group,
            name,
            kind,
            &self.manifest.id,
            target,
        )?;
        self.staged.push(entry);
        Ok(())
    }
}

/// A plugin's executable entrypoint.
pub trait PluginEntrypoint: Send + Sync {
    fn init(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()>;
}

type EntrypointCtor = Arc<dyn Fn() -> Box<dyn PluginEntrypoint> + Send + Sync>;

/// Host-side table mapping entrypoint symbols to constructors.
#[derive(Default, Clone)]
pub struct PluginHost {
    entrypoints: BTreeMap<String, EntrypointCtor>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entrypoint(
        &mut self,
        symbol: &str,
        ctor: impl Fn() -> Box<dyn PluginEntrypoint> + Send + Sync + 'static,
    ) {
        self.entrypoints.insert(symbol.to_string(), Arc::new(ctor));
    }

    fn instantiate(&self, symbol: &str) -> CpmResult<Box<dyn PluginEntrypoint>> {
        let ctor = self.entrypoints.get(symbol).ok_or_else(|| {
            CpmError::invalid_config(format!(
                "entrypoint '{symbol}' is not registered with the plugin host"
            ))
        })?;
        Ok(ctor())
    }
}

/// Discovery + loading orchestration.
pub struct PluginManager {
    host: PluginHost,
}

impl PluginManager {
    pub fn new(host: PluginHost) -> Self {
        Self { host }
    }

    /// Scan `plugins/` directories for manifests. First id wins across the
    /// given roots (workspace before user).
    pub fn discover(
        &self,
        roots: &[(PathBuf, PluginSource)],
    ) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> = Vec::new();
        let mut seen: BTreeMap<String, ()> = BTreeMap::new();

        for (root, source) in roots {
            let Ok(entries) = std::fs::read_dir(root) else {
                continue;
            };
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();

            for dir in dirs {
                let manifest_path = dir.join("plugin.toml");
                if !manifest_path.is_file() {
                    continue;
                }
                let dir_name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                match PluginManifest::load(&manifest_path) {
                    Ok(manifest) => {
                        if manifest.id != dir_name {
                            records.push(PluginRecord {
                                id: dir_name.clone(),
                                manifest,
                                path: dir,
                                source: *source,
                                state: PluginState::Failed,
                                features: Vec::new(),
                                error: Some(format!(
                                    "plugin id must match directory name '{dir_name}'"
                                )),
                            });
                            continue;
                        }
                        if seen.contains_key(&manifest.id) {
                            continue;
                        }
                        seen.insert(manifest.id.clone(), ());
                        records.push(PluginRecord {
                            id: manifest.id.clone(),
                            manifest,
                            path: dir,
                            source: *source,
                            state: PluginState::Pending,
                            features: Vec::new(),
                            error: None,
                        });
                    }
                    Err(e) => {
                        warn!(plugin_dir = %dir.display(), error = %e, "skipping unreadable plugin manifest");
                    }
                }
            }
        }
        records
    }

    /// Load every pending plugin into the registry. Failures isolate.
    pub fn load_all(
        &self,
        records: &mut [PluginRecord],
        registry: &mut FeatureRegistry,
        events: &EventBus,
        workspace_root: &Path,
    ) {
        for record in records.iter_mut() {
            if record.state != PluginState::Pending {
                continue;
            }
            let mut payload = BTreeMap::new();
            payload.insert("plugin".to_string(), Value::from(record.id.as_str()));
            events.emit("pre_plugin_init", payload.clone());

            match self.load_one(record, registry, events, workspace_root) {
                Ok(features) => {
                    record.features = features;
                    record.state = PluginState::Ready;
                    events.emit("post_plugin_init", payload);
                }
                Err(message) => {
                    warn!(plugin = %record.id, error = %message, "plugin load failed");
                    record.state = PluginState::Failed;
                    record.error = Some(message);
                }
            }
        }
    }

    fn load_one(
        &self,
        record: &PluginRecord,
        registry: &mut FeatureRegistry,
        events: &EventBus,
        workspace_root: &Path,
    ) -> Result<Vec<String>, String> {
        let entrypoint = self
            .host
            .instantiate(&record.manifest.entrypoint)
            .map_err(|e| e.to_string())?;

        let mut context = PluginContext {
            manifest: &record.manifest,
            plugin_root: &record.path,
            workspace_root,
            events,
            staged: Vec::new(),
        };
        entrypoint
            .init(&mut context)
            .map_err(|e| format!("plugin {} failed to initialize: {e}", record.manifest.id))?;

        // Commit staged features; roll back everything from this step on the
        // first collision.
        let mut committed: Vec<String> = Vec::new();
        for entry in context.staged {
            let qualified = entry.qualified_name();
            if let Err(e) = registry.register(entry) {
                for done in &committed {
                    registry.unregister(done);
                }
                return Err(e.to_string());
            }
            committed.push(qualified);
        }
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct GoodEntrypoint {
        feature: &'static str,
    }

    impl PluginEntrypoint for GoodEntrypoint {
        fn init(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            context.register_feature(self.feature, FeatureKind::Command, FeatureTarget::Command)?;
            Ok(())
        }
    }

    struct FailingEntrypoint;

    impl PluginEntrypoint for FailingEntrypoint {
        fn init(&self, _context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn write_plugin(root: &Path, id: &str, entrypoint: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            format!(
                "[plugin]\nid = \"{id}\"\nname = \"{id}\"\nversion = \"0.1.0\"\ngroup = \"{id}\"\nentrypoint = \"{entrypoint}\"\nrequires_cpm = \">=0.1\"\n"
            ),
        )
        .unwrap();
    }

    fn host() -> PluginHost {
        let mut host = PluginHost::new();
        host.register_entrypoint("good:Entry", || {
            Box::new(GoodEntrypoint { feature: "lookup" })
        });
        host.register_entrypoint("bad:Entry", || Box::new(FailingEntrypoint));
        host
    }

    #[test]
    fn failing_plugin_is_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("plugins");
        write_plugin(&plugins, "alpha", "bad:Entry");
        write_plugin(&plugins, "beta", "good:Entry");

        let manager = PluginManager::new(host());
        let mut records = manager.discover(&[(plugins, PluginSource::Workspace)]);
        assert_eq!(records.len(), 2);

        let mut registry = FeatureRegistry::new();
        let events = EventBus::new();
        manager.load_all(&mut records, &mut registry, &events, tmp.path());

        let alpha = records.iter().find(|r| r.id == "alpha").unwrap();
        assert_eq!(alpha.state, PluginState::Failed);
        assert!(alpha.error.as_deref().unwrap().contains("boom"));

        let beta = records.iter().find(|r| r.id == "beta").unwrap();
        assert_eq!(beta.state, PluginState::Ready);
        assert_eq!(beta.features, vec!["beta:lookup".to_string()]);
        assert!(registry.resolve("beta:lookup").is_ok());
    }

    #[test]
    fn collision_rolls_back_plugin_features() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("plugins");
        write_plugin(&plugins, "gamma", "multi:Entry");

        struct MultiEntrypoint;
        impl PluginEntrypoint for MultiEntrypoint {
            fn init(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
                context.register_feature("one", FeatureKind::Command, FeatureTarget::Command)?;
                context.register_feature("taken", FeatureKind::Command, FeatureTarget::Command)?;
                Ok(())
            }
        }
        let mut host = PluginHost::new();
        host.register_entrypoint("multi:Entry", || Box::new(MultiEntrypoint));

        let mut registry = FeatureRegistry::new();
        registry
            .register(
                FeatureEntry::new("gamma", "taken", FeatureKind::Command, "builtin", FeatureTarget::Command)
                    .unwrap(),
            )
            .unwrap();

        let manager = PluginManager::new(host);
        let mut records = manager.discover(&[(plugins, PluginSource::Workspace)]);
        let events = EventBus::new();
        manager.load_all(&mut records, &mut registry, &events, tmp.path());

        assert_eq!(records[0].state, PluginState::Failed);
        // "gamma:one" must have been rolled back.
        assert!(registry.resolve("gamma:one").is_err());
        assert!(registry.resolve("gamma:taken").is_ok());
    }

    #[test]
    fn first_id_wins_across_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws-plugins");
        let user = tmp.path().join("user-plugins");
        write_plugin(&ws, "dup", "good:Entry");
        write_plugin(&user, "dup", "bad:Entry");

        let manager = PluginManager::new(host());
        let records = manager.discover(&[
            (ws, PluginSource::Workspace),
            (user, PluginSource::User),
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, PluginSource::Workspace);
        assert_eq!(records[0].manifest.entrypoint, "good:Entry");
    }

    #[test]
    fn id_directory_mismatch_fails_record() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("plugins");
        let dir = plugins.join("wrongdir");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            "[plugin]\nid = \"other\"\nname = \"x\"\nversion = \"1\"\ngroup = \"g\"\nentrypoint = \"e:E\"\nrequires_cpm = \"*\"\n",
        )
        .unwrap();

        let manager = PluginManager::new(PluginHost::new());
        let records = manager.discover(&[(plugins, PluginSource::Workspace)]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, PluginState::Failed);
    }
}
