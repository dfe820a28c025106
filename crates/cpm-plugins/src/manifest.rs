//! Plugin manifest (`plugin.toml`).
//!
//! ```toml
//! [plugin]
//! id = "acme_retriever"
//! name = "Acme Retriever"
//! version = "0.3.0"
//! group = "acme"
//! entrypoint = "acme_retriever:AcmeEntrypoint"
//! requires_cpm = ">=0.1"
//! ```
//! All six fields are required non-empty strings; `id` must match the plugin
//! directory name.

use std::path::Path;

use serde::Deserialize;

use cpm_core::errors::{CpmError, CpmResult};

/// Parsed `[plugin]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub group: String,
    pub entrypoint: String,
    pub requires_cpm: String,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    plugin: Option<PluginManifest>,
}

impl PluginManifest {
    pub fn load(path: &Path) -> CpmResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CpmError::invalid_config(format!("unable to read manifest at {}: {e}", path.display())))?;
        let document: ManifestDocument = toml::from_str(&raw)
            .map_err(|e| CpmError::invalid_config(format!("malformed manifest at {}: {e}", path.display())))?;
        let manifest = document
            .plugin
            .ok_or_else(|| CpmError::invalid_config("missing or malformed [plugin] section"))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> CpmResult<()> {
        for (label, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("group", &self.group),
            ("entrypoint", &self.entrypoint),
            ("requires_cpm", &self.requires_cpm),
        ] {
            if value.trim().is_empty() {
                return Err(CpmError::invalid_config(format!("'{label}' cannot be empty")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("plugin.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_valid_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(
            tmp.path(),
            r#"
[plugin]
id = "sample"
name = "Sample"
version = "0.1.0"
group = "sample"
entrypoint = "sample:Entrypoint"
requires_cpm = ">=0.1"
"#,
        );
        let manifest = PluginManifest::load(&path).unwrap();
        assert_eq!(manifest.id, "sample");
        assert_eq!(manifest.entrypoint, "sample:Entrypoint");
    }

    #[test]
    fn rejects_missing_section() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(tmp.path(), "[other]\nx = 1\n");
        assert!(PluginManifest::load(&path).is_err());
    }

    #[test]
    fn rejects_blank_field() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_manifest(
            tmp.path(),
            r#"
[plugin]
id = "sample"
name = " "
version = "0.1.0"
group = "sample"
entrypoint = "sample:Entrypoint"
requires_cpm = ">=0.1"
"#,
        );
        assert!(PluginManifest::load(&path).is_err());
    }
}
