//! Built-in feature registration.
//!
//! Every CLI command, the default builder and the native retriever are
//! features like any plugin-supplied one; the CLI resolves `cpm:<name>`
//! through the registry before dispatching.

use std::path::Path;
use std::sync::Arc;

use cpm_core::build::Embedder;
use cpm_core::errors::CpmResult;
use cpm_core::retrieve::{run_query, RetrievalComponents, RetrievalPayload, RetrievalRequest};

use crate::registry::{FeatureEntry, FeatureKind, FeatureRegistry, FeatureTarget, Retriever};

/// Builtin feature group.
pub const GROUP: &str = "cpm";

/// Builtin command names.
pub const COMMANDS: [&str; 17] = [
    "build",
    "query",
    "replay",
    "diff",
    "install",
    "uninstall",
    "use",
    "prune",
    "update",
    "list",
    "list-remote",
    "publish",
    "embed",
    "pool",
    "benchmark",
    "plugins",
    "doctor",
];

/// The native retriever: flat-IP search over installed packets.
pub struct NativeRetriever {
    components: RetrievalComponents,
}

impl Default for NativeRetriever {
    fn default() -> Self {
        Self {
            components: RetrievalComponents::default(),
        }
    }
}

impl Retriever for NativeRetriever {
    fn retrieve(
        &self,
        packet_dir: &Path,
        request: &RetrievalRequest,
        embedder: &dyn Embedder,
    ) -> RetrievalPayload {
        run_query(packet_dir, request, embedder, &self.components)
    }
}

/// Register the builtin commands, builder and retriever.
pub fn register_builtin_features(registry: &mut FeatureRegistry) -> CpmResult<()> {
    for command in COMMANDS {
        registry.register(FeatureEntry::new(
            GROUP,
            command,
            FeatureKind::Command,
            "builtin",
            FeatureTarget::Command,
        )?)?;
    }
    registry.register(FeatureEntry::new(
        GROUP,
        "default-builder",
        FeatureKind::Builder,
        "builtin",
        FeatureTarget::Builder,
    )?)?;
    registry.register(FeatureEntry::new(
        GROUP,
        "native-retriever",
        FeatureKind::Retriever,
        "builtin",
        FeatureTarget::Retriever(Arc::new(NativeRetriever::default())),
    )?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_once() {
        let mut registry = FeatureRegistry::new();
        register_builtin_features(&mut registry).unwrap();
        assert!(registry.resolve("cpm:build").is_ok());
        assert!(registry.resolve("native-retriever").is_ok());
        assert_eq!(
            registry.entries_of(FeatureKind::Retriever).len(),
            1
        );
        // Second registration collides.
        assert!(register_builtin_features(&mut registry).is_err());
    }
}
