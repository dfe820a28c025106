//! CPM data models.
//!
//! Strongly-typed representations of the packet wire formats. Models are
//! mostly "dumb" data: higher layers apply policy, validation and I/O.
//! Canonical hashing never relies on default serde formatting - use
//! `crate::determinism` for anything identity-bearing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{CpmError, CpmResult};

/// One unit of embeddable text with a stable id and open metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DocChunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Metadata value as a string, when present and a string.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Embedding configuration recorded in the packet manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub model: String,
    pub dim: u32,
    pub dtype: String,
    pub normalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_seq_length: Option<u32>,
}

impl EmbeddingSpec {
    pub fn validate(&self) -> CpmResult<()> {
        if self.model.trim().is_empty() {
            return Err(CpmError::manifest_invalid(
                "manifest.embedding.model is required",
            ));
        }
        Ok(())
    }
}

/// A `{algo, value}` checksum entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checksum {
    pub algo: String,
    pub value: String,
}

impl Checksum {
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            algo: "sha256".to_string(),
            value: value.into(),
        }
    }
}

/// The packet manifest (`manifest.json`).
///
/// Unknown top-level keys are preserved under `extras` and re-emitted
/// verbatim on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketManifest {
    pub schema_version: String,
    pub packet_id: String,
    pub embedding: EmbeddingSpec,
    #[serde(default)]
    pub similarity: BTreeMap<String, Value>,
    #[serde(default)]
    pub files: BTreeMap<String, Value>,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub source: BTreeMap<String, Value>,
    #[serde(default)]
    pub cpm: BTreeMap<String, Value>,
    #[serde(default)]
    pub incremental: BTreeMap<String, Value>,
    #[serde(default)]
    pub checksums: BTreeMap<String, Checksum>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Value>,
}

impl PacketManifest {
    pub fn validate(&self) -> CpmResult<()> {
        self.embedding.validate()
    }

    pub fn doc_count(&self) -> u64 {
        self.counts.get("docs").copied().unwrap_or(0)
    }

    pub fn vector_count(&self) -> u64 {
        self.counts.get("vectors").copied().unwrap_or(0)
    }

    /// The retriever suggested for this packet, from `extras` or `cpm`.
    pub fn suggested_retriever(&self) -> Option<String> {
        for map in [&self.extras, &self.cpm] {
            if let Some(v) = map.get("suggested_retriever").and_then(|v| v.as_str()) {
                let v = v.trim();
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
        None
    }
}

/// Packet metadata file (`cpm.yml`).
///
/// Installed-version enumeration relies on `version` being non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketInfo {
    pub cpm_schema: u32,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entrypoints: Vec<String>,
    pub embedding_model: String,
    pub embedding_dim: u32,
    pub embedding_normalized: bool,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_extras_roundtrip() {
        let raw = json!({
            "schema_version": "1.0",
            "packet_id": "demo",
            "embedding": {"model": "m", "dim": 4, "dtype": "float16", "normalized": true},
            "counts": {"docs": 2, "vectors": 2},
            "custom_section": {"keep": "me"},
            "build_status": "ok"
        });
        let manifest: PacketManifest = serde_json::from_value(raw).unwrap();
        assert_eq!(
            manifest.extras.get("custom_section"),
            Some(&json!({"keep": "me"}))
        );
        let back = serde_json::to_value(&manifest).unwrap();
        assert_eq!(back["custom_section"]["keep"], "me");
        assert_eq!(back["build_status"], "ok");
    }

    #[test]
    fn manifest_requires_model() {
        let raw = json!({
            "schema_version": "1.0",
            "packet_id": "demo",
            "embedding": {"model": "", "dim": 4, "dtype": "float16", "normalized": true}
        });
        let manifest: PacketManifest = serde_json::from_value(raw).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn chunk_metadata_access() {
        let chunk = DocChunk::new("a:1", "text").with_meta("path", json!("docs/a.md"));
        assert_eq!(chunk.meta_str("path"), Some("docs/a.md"));
        assert_eq!(chunk.meta_str("missing"), None);
    }
}
