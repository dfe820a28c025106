//! Feature registry.
//!
//! Features are registered under a qualified `group:name`. Resolution accepts
//! either the qualified form (exact match) or a bare name, which must be
//! unambiguous. Internal storage is a `BTreeMap` so iteration order is
//! deterministic; there is no global mutable state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use cpm_core::build::Embedder;
use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::retrieve::{RetrievalPayload, RetrievalRequest};

/// What a feature is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Command,
    Builder,
    Retriever,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Builder => "builder",
            Self::Retriever => "retriever",
        }
    }
}

/// A retrieval feature: resolves a query against a packet directory.
pub trait Retriever: Send + Sync {
    fn retrieve(
        &self,
        packet_dir: &Path,
        request: &RetrievalRequest,
        embedder: &dyn Embedder,
    ) -> RetrievalPayload;
}

/// What the registry dispatches to when a feature is invoked.
#[derive(Clone)]
pub enum FeatureTarget {
    /// Built-in command; the CLI maps the resolved name onto its handler.
    Command,
    /// Built-in builder; the CLI maps the resolved name onto its pipeline.
    Builder,
    Retriever(Arc<dyn Retriever>),
}

impl std::fmt::Debug for FeatureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "Command"),
            Self::Builder => write!(f, "Builder"),
            Self::Retriever(_) => write!(f, "Retriever(..)"),
        }
    }
}

/// One registered feature.
#[derive(Debug, Clone)]
pub struct FeatureEntry {
    pub group: String,
    pub name: String,
    pub kind: FeatureKind,
    pub origin: String,
    pub target: FeatureTarget,
}

fn validate_component(label: &str, value: &str) -> CpmResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(CpmError::invalid_spec(format!("{label} cannot be empty")));
    }
    if v.contains(':') {
        return Err(CpmError::invalid_spec(format!("{label} may not contain ':'")));
    }
    Ok(v.to_string())
}

impl FeatureEntry {
    pub fn new(
        group: &str,
        name: &str,
        kind: FeatureKind,
        origin: &str,
        target: FeatureTarget,
    ) -> CpmResult<Self> {
        Ok(Self {
            group: validate_component("group", group)?,
            name: validate_component("name", name)?,
            kind,
            origin: validate_component("origin", origin)?,
            target,
        })
    }

    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.group, self.name)
    }
}

/// Registry of features keyed by qualified name.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    by_qualified: BTreeMap<String, FeatureEntry>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_qualified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_qualified.is_empty()
    }

    /// Register an entry; collides on an already-used qualified name.
    pub fn register(&mut self, entry: FeatureEntry) -> CpmResult<()> {
        let qualified = entry.qualified_name();
        if self.by_qualified.contains_key(&qualified) {
            return Err(CpmError::feature_collision(format!(
                "{qualified} is already registered"
            )));
        }
        self.by_qualified.insert(qualified, entry);
        Ok(())
    }

    /// Drop an entry (plugin rollback).
    pub fn unregister(&mut self, qualified: &str) {
        self.by_qualified.remove(qualified);
    }

    fn candidates(&self, name: &str) -> Vec<&FeatureEntry> {
        self.by_qualified
            .values()
            .filter(|e| e.name == name)
            .collect()
    }

    /// Resolve `group:name` exactly, or a bare `name` when unambiguous.
    pub fn resolve(&self, name_or_qualified: &str) -> CpmResult<&FeatureEntry> {
        if name_or_qualified.contains(':') {
            return self.by_qualified.get(name_or_qualified).ok_or_else(|| {
                CpmError::feature_not_found(format!("{name_or_qualified} is not registered"))
            });
        }
        let candidates = self.candidates(name_or_qualified);
        match candidates.len() {
            0 => Err(CpmError::feature_not_found(format!(
                "{name_or_qualified} is not registered"
            ))),
            1 => Ok(candidates[0]),
            _ => {
                let mut names: Vec<String> =
                    candidates.iter().map(|e| e.qualified_name()).collect();
                names.sort();
                Err(CpmError::ambiguous_feature(format!(
                    "{name_or_qualified} is ambiguous; candidates: {}",
                    names.join(", ")
                )))
            }
        }
    }

    /// Feature names for display: simple when unique, qualified otherwise.
    pub fn display_names(&self) -> Vec<String> {
        let mut by_name: BTreeMap<&str, Vec<&FeatureEntry>> = BTreeMap::new();
        for entry in self.by_qualified.values() {
            by_name.entry(entry.name.as_str()).or_default().push(entry);
        }
        let mut out = Vec::new();
        for (name, entries) in by_name {
            if entries.len() == 1 {
                out.push(name.to_string());
            } else {
                let mut qualified: Vec<String> =
                    entries.iter().map(|e| e.qualified_name()).collect();
                qualified.sort();
                out.extend(qualified);
            }
        }
        out
    }

    /// All entries in qualified-name order.
    pub fn entries(&self) -> impl Iterator<Item = &FeatureEntry> {
        self.by_qualified.values()
    }

    /// Entries of one kind, in qualified-name order.
    pub fn entries_of(&self, kind: FeatureKind) -> Vec<&FeatureEntry> {
        self.by_qualified
            .values()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpm_core::errors::ErrorKind;

    fn entry(group: &str, name: &str) -> FeatureEntry {
        FeatureEntry::new(group, name, FeatureKind::Command, "builtin", FeatureTarget::Command)
            .unwrap()
    }

    #[test]
    fn collision_on_duplicate_qualified_name() {
        let mut reg = FeatureRegistry::new();
        reg.register(entry("cpm", "build")).unwrap();
        let err = reg.register(entry("cpm", "build")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FeatureCollision);
    }

    #[test]
    fn bare_name_ambiguity_lists_sorted_candidates() {
        let mut reg = FeatureRegistry::new();
        reg.register(entry("zeta", "query")).unwrap();
        reg.register(entry("alpha", "query")).unwrap();

        let err = reg.resolve("query").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AmbiguousFeature);
        assert!(err.message.contains("alpha:query, zeta:query"));

        // Qualified resolution still works.
        assert_eq!(reg.resolve("alpha:query").unwrap().group, "alpha");
    }

    #[test]
    fn not_found() {
        let reg = FeatureRegistry::new();
        let err = reg.resolve("nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::FeatureNotFound);
        let err = reg.resolve("cpm:nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::FeatureNotFound);
    }

    #[test]
    fn display_names_qualify_duplicates() {
        let mut reg = FeatureRegistry::new();
        reg.register(entry("cpm", "build")).unwrap();
        reg.register(entry("cpm", "query")).unwrap();
        reg.register(entry("ext", "query")).unwrap();
        assert_eq!(
            reg.display_names(),
            vec!["build".to_string(), "cpm:query".to_string(), "ext:query".to_string()]
        );
    }

    #[test]
    fn components_reject_colons_and_blanks() {
        assert!(FeatureEntry::new("a:b", "x", FeatureKind::Command, "o", FeatureTarget::Command)
            .is_err());
        assert!(FeatureEntry::new("g", "", FeatureKind::Command, "o", FeatureTarget::Command)
            .is_err());
    }
}
