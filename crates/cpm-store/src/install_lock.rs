//! Install locks: the per-packet record of what was selected at install
//! time, with append-only history snapshots for as-of queries.
//!
//! Snapshot filenames are UTC timestamps at microsecond resolution, so the
//! history directory sorts chronologically by name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cpm_core::errors::{CpmError, CpmResult};

use crate::layout::WorkspaceLayout;

/// One upstream source recorded in the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSource {
    pub uri: String,
    pub digest: String,
    #[serde(default)]
    pub signature: bool,
    #[serde(default)]
    pub sbom: bool,
    #[serde(default)]
    pub provenance: bool,
    #[serde(default)]
    pub trust_score: f64,
}

/// The install lock document (`state/install/<name>.lock.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallLock {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_digest: Option<String>,
    #[serde(default)]
    pub sources: Vec<InstallSource>,
    #[serde(default)]
    pub signature: bool,
    #[serde(default)]
    pub sbom: bool,
    #[serde(default)]
    pub provenance: bool,
    #[serde(default)]
    pub trust_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_retriever: Option<String>,
    pub installed_at: i64,
    #[serde(default)]
    pub artifact_files: Vec<String>,
    #[serde(default)]
    pub no_embed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_artifact: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub auto_resolved_by_query: bool,
}

impl InstallLock {
    /// Minimal lock written when `query` runs against an uninstalled packet.
    pub fn auto_resolved(
        name: &str,
        version: &str,
        selected_model: &str,
        selected_provider: Option<String>,
        suggested_retriever: Option<String>,
        installed_at: i64,
    ) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            packet_ref: None,
            packet_digest: None,
            sources: Vec::new(),
            signature: false,
            sbom: false,
            provenance: false,
            trust_score: 0.0,
            selected_model: Some(selected_model.to_string()),
            selected_provider,
            suggested_retriever,
            installed_at,
            artifact_files: Vec::new(),
            no_embed: false,
            model_artifact: None,
            auto_resolved_by_query: true,
        }
    }

    /// Backfill `sources` from the flat fields for locks written before the
    /// list existed.
    fn normalized(mut self) -> Self {
        if self.sources.is_empty() {
            if let (Some(packet_ref), Some(digest)) = (&self.packet_ref, &self.packet_digest) {
                self.sources.push(InstallSource {
                    uri: format!("oci://{packet_ref}"),
                    digest: digest.clone(),
                    signature: self.signature,
                    sbom: self.sbom,
                    provenance: self.provenance,
                    trust_score: self.trust_score,
                });
            }
        }
        self
    }
}

fn lock_path(layout: &WorkspaceLayout, name: &str) -> PathBuf {
    layout.install_dir().join(format!("{name}.lock.json"))
}

/// Read the current install lock for a packet, if any.
pub fn read_install_lock(layout: &WorkspaceLayout, name: &str) -> Option<InstallLock> {
    let raw = std::fs::read_to_string(lock_path(layout, name)).ok()?;
    let lock: InstallLock = serde_json::from_str(&raw).ok()?;
    Some(lock.normalized())
}

/// Write the install lock and snapshot it into history.
pub fn write_install_lock(
    layout: &WorkspaceLayout,
    name: &str,
    lock: &InstallLock,
    now: DateTime<Utc>,
) -> CpmResult<PathBuf> {
    let path = lock_path(layout, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(lock)?)?;

    let history = layout.install_history_dir(name);
    std::fs::create_dir_all(&history)?;
    let stamp = now.format("%Y%m%dT%H%M%S%.6fZ").to_string();
    let snapshot = history.join(format!("{stamp}.lock.json"));
    std::fs::copy(&path, &snapshot)
        .map_err(|e| CpmError::io(format!("history snapshot: {e}")))?;
    Ok(path)
}

fn parse_snapshot_stamp(file_name: &str) -> Option<DateTime<Utc>> {
    let raw = file_name.strip_suffix(".lock.json")?;
    let naive = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S%.6fZ")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%SZ"))
        .ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// The newest history snapshot at or before `as_of`.
pub fn read_install_lock_as_of(
    layout: &WorkspaceLayout,
    name: &str,
    as_of: DateTime<Utc>,
) -> Option<InstallLock> {
    let history = layout.install_history_dir(name);
    let entries = std::fs::read_dir(&history).ok()?;
    let mut chosen: Option<(DateTime<Utc>, PathBuf)> = None;
    for entry in entries.filter_map(|e| e.ok()) {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = parse_snapshot_stamp(&file_name) else {
            continue;
        };
        if stamp > as_of {
            continue;
        }
        match &chosen {
            Some((best, _)) if stamp <= *best => {}
            _ => chosen = Some((stamp, entry.path())),
        }
    }
    let (_, path) = chosen?;
    let raw = std::fs::read_to_string(path).ok()?;
    let lock: InstallLock = serde_json::from_str(&raw).ok()?;
    Some(lock.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn layout() -> (tempfile::TempDir, WorkspaceLayout) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path().join(".cpm"));
        layout.ensure().unwrap();
        (tmp, layout)
    }

    fn lock_for(version: &str) -> InstallLock {
        InstallLock::auto_resolved("docs", version, "model-a", None, None, 0)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_tmp, layout) = layout();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        write_install_lock(&layout, "docs", &lock_for("1.0.0"), now).unwrap();
        let back = read_install_lock(&layout, "docs").unwrap();
        assert_eq!(back.version, "1.0.0");
        assert_eq!(back.selected_model.as_deref(), Some("model-a"));
    }

    #[test]
    fn as_of_selects_earlier_snapshot() {
        let (_tmp, layout) = layout();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();
        write_install_lock(&layout, "docs", &lock_for("1.0.0"), t1).unwrap();
        write_install_lock(&layout, "docs", &lock_for("2.0.0"), t2).unwrap();

        let mid = Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap();
        let lock = read_install_lock_as_of(&layout, "docs", mid).unwrap();
        assert_eq!(lock.version, "1.0.0");

        let later = Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap();
        let lock = read_install_lock_as_of(&layout, "docs", later).unwrap();
        assert_eq!(lock.version, "2.0.0");

        let before = Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap();
        assert!(read_install_lock_as_of(&layout, "docs", before).is_none());
    }

    #[test]
    fn legacy_flat_fields_backfill_sources() {
        let (_tmp, layout) = layout();
        let path = layout.install_dir().join("docs.lock.json");
        std::fs::create_dir_all(layout.install_dir()).unwrap();
        std::fs::write(
            &path,
            serde_json::json!({
                "name": "docs",
                "version": "1.0.0",
                "packet_ref": "registry.local/cpm/docs:1.0.0",
                "packet_digest": "sha256:abc",
                "signature": true,
                "trust_score": 0.33,
                "installed_at": 0
            })
            .to_string(),
        )
        .unwrap();
        let lock = read_install_lock(&layout, "docs").unwrap();
        assert_eq!(lock.sources.len(), 1);
        assert!(lock.sources[0].signature);
        assert_eq!(lock.sources[0].uri, "oci://registry.local/cpm/docs:1.0.0");
    }
}
