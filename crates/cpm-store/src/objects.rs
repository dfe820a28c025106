//! Content-addressed object cache for fetched query sources.
//!
//! `dir://` sources are copied under `cache/objects/<sha256-of-uri>/` so a
//! query against a remote or out-of-tree packet resolves to a stable local
//! directory. OCI sources land in the same keyed slot after the registry
//! client pulls them.

use std::path::{Path, PathBuf};

use cpm_core::determinism::sha256_hex;
use cpm_core::errors::{CpmError, CpmResult};

use crate::layout::WorkspaceLayout;

/// Cache slot for a source URI.
pub fn object_dir(layout: &WorkspaceLayout, uri: &str) -> PathBuf {
    layout.objects_cache_dir().join(sha256_hex(uri.as_bytes()))
}

fn copy_tree(from: &Path, to: &Path) -> CpmResult<()> {
    for entry in walkdir::WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|e| CpmError::io(format!("copy {}: {e}", from.display())))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| CpmError::invariant(format!("copy escaped root: {e}")))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Materialize a `dir://` source into the object cache and return the slot.
/// Re-fetching the same URI refreshes the slot.
pub fn fetch_dir_source(layout: &WorkspaceLayout, uri: &str) -> CpmResult<PathBuf> {
    let path = uri
        .strip_prefix("dir://")
        .ok_or_else(|| CpmError::invalid_spec(format!("not a dir:// source: {uri}")))?;
    let source = PathBuf::from(path);
    if !source.is_dir() {
        return Err(CpmError::packet_not_found(format!(
            "source directory not found: {}",
            source.display()
        )));
    }
    let slot = object_dir(layout, uri);
    if slot.exists() {
        std::fs::remove_dir_all(&slot)?;
    }
    std::fs::create_dir_all(&slot)?;
    copy_tree(&source, &slot)?;
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_source_lands_in_keyed_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path().join(".cpm"));
        layout.ensure().unwrap();

        let source = tmp.path().join("packet");
        std::fs::create_dir_all(source.join("faiss")).unwrap();
        std::fs::write(source.join("manifest.json"), "{}").unwrap();

        let uri = format!("dir://{}", source.display());
        let slot = fetch_dir_source(&layout, &uri).unwrap();
        assert!(slot.starts_with(layout.objects_cache_dir()));
        assert!(slot.join("manifest.json").exists());

        // Same URI -> same slot.
        let again = fetch_dir_source(&layout, &uri).unwrap();
        assert_eq!(slot, again);
    }

    #[test]
    fn missing_source_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path().join(".cpm"));
        layout.ensure().unwrap();
        assert!(fetch_dir_source(&layout, "dir:///does/not/exist").is_err());
    }
}
