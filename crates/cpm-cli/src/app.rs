//! Application bootstrap: workspace resolution, feature registry, plugins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cpm_core::build::Embedder;
use cpm_core::errors::{CpmError, CpmResult};
use cpm_plugins::builtin::register_builtin_features;
use cpm_plugins::{
    EventBus, FeatureKind, FeatureRegistry, FeatureTarget, PluginHost, PluginManager,
    PluginRecord, PluginSource, Retriever,
};
use cpm_pool::{EmbedMode, EmbeddingClient};
use cpm_store::{PackageStore, WorkspaceLayout};

use crate::config::EmbeddingsConfig;

/// Bootstrapped application state shared by command handlers.
pub struct CpmApp {
    pub layout: WorkspaceLayout,
    pub store: PackageStore,
    pub registry: FeatureRegistry,
    pub events: EventBus,
    pub plugins: Vec<PluginRecord>,
}

impl CpmApp {
    /// Resolve the workspace near `start_dir`, register builtins and load
    /// plugins from the workspace and user plugin directories.
    pub fn bootstrap(start_dir: &Path) -> CpmResult<Self> {
        let layout = WorkspaceLayout::discover_or_default(start_dir);
        layout.ensure()?;
        let store = PackageStore::new(layout.clone())?;

        let mut registry = FeatureRegistry::new();
        register_builtin_features(&mut registry)?;

        let events = EventBus::new();
        let manager = PluginManager::new(PluginHost::new());
        let mut roots: Vec<(PathBuf, PluginSource)> =
            vec![(layout.plugins_dir(), PluginSource::Workspace)];
        if let Some(data_dir) = dirs::data_dir() {
            roots.push((data_dir.join("cpm").join("plugins"), PluginSource::User));
        }
        events.emit("pre_discovery", Default::default());
        let mut plugins = manager.discover(&roots);
        events.emit("post_discovery", Default::default());
        manager.load_all(&mut plugins, &mut registry, &events, &layout.root);
        events.emit("ready", Default::default());

        Ok(Self {
            layout,
            store,
            registry,
            events,
            plugins,
        })
    }

    /// Resolve a command feature (`cpm:<name>` or bare name) and require it
    /// to be a command.
    pub fn resolve_command(&self, name: &str) -> CpmResult<String> {
        let entry = self.registry.resolve(name)?;
        if entry.kind != FeatureKind::Command {
            return Err(CpmError::feature_not_found(format!(
                "{} is a {}, not a command",
                entry.qualified_name(),
                entry.kind.as_str()
            )));
        }
        Ok(entry.qualified_name())
    }

    /// Resolve a retriever by name with the suggested-plugin fallback:
    /// an unavailable suggested retriever warns and falls back to
    /// `cpm:native-retriever`.
    pub fn resolve_retriever(
        &self,
        requested: Option<&str>,
        suggested: Option<&str>,
    ) -> CpmResult<(String, Arc<dyn Retriever>)> {
        let fallback = "cpm:native-retriever";
        let wanted = requested.or(suggested).unwrap_or("native-retriever");

        let entry = match self.registry.resolve(wanted) {
            Ok(entry) => entry,
            Err(e) => {
                if requested.is_some() {
                    return Err(e);
                }
                if suggested.is_some() {
                    crate::output::line(
                        "query",
                        format!(
                            "suggested retriever '{wanted}' is not installed; install the plugin providing it, then retry. Falling back to '{fallback}'."
                        ),
                    );
                }
                self.registry.resolve(fallback)?
            }
        };
        match &entry.target {
            FeatureTarget::Retriever(retriever) => {
                Ok((entry.qualified_name(), Arc::clone(retriever)))
            }
            _ => Err(CpmError::feature_not_found(format!(
                "{} is not a retriever",
                entry.qualified_name()
            ))),
        }
    }

    /// Build the embedder for a command invocation: explicit URL/mode flags
    /// win, then the default provider in `embeddings.yml`, then the local
    /// pool default.
    pub fn embedder(
        &self,
        embed_url: Option<&str>,
        embed_mode: Option<&str>,
    ) -> CpmResult<Box<dyn Embedder>> {
        let config = EmbeddingsConfig::load(&self.layout);
        let provider = config.default_provider();

        let url = embed_url
            .map(String::from)
            .or_else(|| provider.map(|(_, p)| p.url.clone()))
            .unwrap_or_else(|| "http://127.0.0.1:8876".to_string());
        let mode = match embed_mode {
            Some(mode) => EmbedMode::parse(mode)?,
            // The internal pool speaks /embed; a provider whose configured
            // embeddings path is OpenAI-shaped switches the wire format.
            None => match provider {
                Some((_, p))
                    if p.http
                        .as_ref()
                        .and_then(|h| h.embeddings_path.as_deref())
                        .map(|path| path.contains("embeddings"))
                        .unwrap_or(false) =>
                {
                    EmbedMode::OpenAi
                }
                _ => EmbedMode::Pool,
            },
        };

        let mut client = EmbeddingClient::new(&url, mode);
        if let Some((_, p)) = provider {
            if let Some(timeout) = p.timeout {
                client = client.with_timeout(timeout);
            }
            if let Some(batch) = p.batch_size {
                client = client.with_input_size(batch);
            }
            if let Some(auth) = &p.auth {
                if auth.r#type.as_deref() == Some("bearer") {
                    client = client.with_api_key(auth.token.clone());
                }
            }
        }
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_registers_builtins() {
        let tmp = tempfile::tempdir().unwrap();
        let app = CpmApp::bootstrap(tmp.path()).unwrap();
        assert!(app.registry.resolve("cpm:query").is_ok());
        assert_eq!(app.resolve_command("build").unwrap(), "cpm:build");
        assert!(app.resolve_command("native-retriever").is_err());
    }

    #[test]
    fn retriever_fallback_for_missing_suggestion() {
        let tmp = tempfile::tempdir().unwrap();
        let app = CpmApp::bootstrap(tmp.path()).unwrap();
        let (name, _) = app
            .resolve_retriever(None, Some("ghost:retriever"))
            .unwrap();
        assert_eq!(name, "cpm:native-retriever");

        // An explicitly requested missing retriever is an error.
        assert!(app.resolve_retriever(Some("ghost:retriever"), None).is_err());
    }
}
