//! OCI artifact transport: a thin wrapper over the `oras` CLI with retries,
//! allowlist enforcement, size caps and token redaction in logged commands.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use cpm_core::errors::{CpmError, CpmResult};

use crate::security::{assert_allowlisted, redact_command_for_log, ReferrerEvidence};

/// OCI client configuration (`[oci]` in `config.toml`).
#[derive(Debug, Clone)]
pub struct OciClientConfig {
    pub timeout_seconds: f64,
    pub max_retries: u32,
    pub backoff_seconds: f64,
    pub insecure: bool,
    pub allowlist_domains: Vec<String>,
    pub max_artifact_size_bytes: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl Default for OciClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30.0,
            max_retries: 2,
            backoff_seconds: 0.2,
            insecure: false,
            allowlist_domains: Vec::new(),
            max_artifact_size_bytes: None,
            username: None,
            password: None,
            token: None,
        }
    }
}

/// Result of a pull.
#[derive(Debug, Clone)]
pub struct OciPullResult {
    pub r#ref: String,
    pub digest: Option<String>,
    pub files: Vec<PathBuf>,
}

/// Result of a push.
#[derive(Debug, Clone)]
pub struct OciPushResult {
    pub r#ref: String,
    pub digest: String,
}

/// Referrer discovery outcome (signature / sbom / provenance artifacts).
pub type ReferrerReport = ReferrerEvidence;

/// Thin `oras` wrapper.
pub struct OciClient {
    config: OciClientConfig,
}

struct RunOutput {
    stdout: String,
    stderr: String,
}

impl OciClient {
    pub fn new(config: OciClientConfig) -> Self {
        Self { config }
    }

    /// Resolve a ref to its digest.
    pub fn resolve(&self, r#ref: &str) -> CpmResult<String> {
        assert_allowlisted(r#ref, &self.config.allowlist_domains)?;
        let reference = r#ref;
        let output = self.run(&["resolve", reference])?;
        extract_digest(&output.stdout)
            .or_else(|| extract_digest(&output.stderr))
            .ok_or_else(|| {
                CpmError::upstream(format!("unable to resolve digest for ref '{reference}'"))
            })
    }

    /// Tags published for a repository ref.
    pub fn list_tags(&self, r#ref: &str) -> CpmResult<Vec<String>> {
        assert_allowlisted(r#ref, &self.config.allowlist_domains)?;
        let output = self.run(&["repo", "tags", r#ref])?;
        let text = output.stdout.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(payload) = serde_json::from_str::<serde_json::Value>(text) {
            if let Some(tags) = payload.get("tags").and_then(|t| t.as_array()) {
                return Ok(tags.iter().filter_map(|t| t.as_str()).map(String::from).collect());
            }
            if let Some(list) = payload.as_array() {
                return Ok(list.iter().filter_map(|t| t.as_str()).map(String::from).collect());
            }
        }
        Ok(text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Pull an artifact into `output_dir`; enforces the size cap.
    pub fn pull(&self, ref_or_digest: &str, output_dir: &Path) -> CpmResult<OciPullResult> {
        assert_allowlisted(ref_or_digest, &self.config.allowlist_domains)?;
        std::fs::create_dir_all(output_dir)?;
        let out_str = output_dir.to_string_lossy().to_string();
        let output = self.run(&["pull", ref_or_digest, "-o", &out_str])?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in walk_files(output_dir)? {
            files.push(entry);
        }
        self.enforce_size_limit(&files)?;
        Ok(OciPullResult {
            r#ref: ref_or_digest.to_string(),
            digest: extract_digest(&output.stdout).or_else(|| extract_digest(&output.stderr)),
            files,
        })
    }

    /// Push files as one artifact; returns the pushed digest.
    pub fn push(&self, r#ref: &str, files: &[PathBuf]) -> CpmResult<OciPushResult> {
        assert_allowlisted(r#ref, &self.config.allowlist_domains)?;
        let mut args: Vec<String> = vec!["push".to_string(), r#ref.to_string()];
        for file in files {
            args.push(file.to_string_lossy().to_string());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs)?;
        let digest = match extract_digest(&output.stdout).or_else(|| extract_digest(&output.stderr)) {
            Some(d) => d,
            None => self.resolve(r#ref)?,
        };
        Ok(OciPushResult {
            r#ref: r#ref.to_string(),
            digest,
        })
    }

    /// Discover referrers of `ref@digest` and classify them by artifact type.
    pub fn discover_referrers(&self, ref_at_digest: &str) -> CpmResult<ReferrerReport> {
        assert_allowlisted(ref_at_digest, &self.config.allowlist_domains)?;
        let output = self.run(&["discover", ref_at_digest, "--format", "json"])?;
        Ok(classify_referrers(&output.stdout))
    }

    fn run(&self, args: &[&str]) -> CpmResult<RunOutput> {
        let mut command: Vec<String> = std::iter::once("oras".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        if self.config.insecure {
            command.push("--insecure".to_string());
        }
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            command.extend([
                "--username".to_string(),
                username.clone(),
                "--password".to_string(),
                password.clone(),
            ]);
        } else if let Some(token) = &self.config.token {
            command.extend(["--token".to_string(), token.clone()]);
        }

        let retries = self.config.max_retries.max(1);
        let backoff = self.config.backoff_seconds.max(0.0);
        let mut last_error: Option<CpmError> = None;

        for attempt in 1..=retries {
            debug!(
                attempt,
                retries,
                cmd = %redact_command_for_log(&command).join(" "),
                "oci command"
            );
            let result = Command::new(&command[0]).args(&command[1..]).output();
            match result {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    if output.status.success() {
                        return Ok(RunOutput { stdout, stderr });
                    }
                    last_error = Some(CpmError::upstream(format!(
                        "oras command failed (exit={}) cmd='{}' err='{}'",
                        output.status.code().unwrap_or(-1),
                        redact_command_for_log(&command).join(" "),
                        stderr.trim()
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CpmError::invalid_config(
                        "oras CLI not found. Install ORAS and ensure it is available in PATH.",
                    ));
                }
                Err(e) => {
                    last_error = Some(CpmError::upstream(format!("oras spawn failed: {e}")));
                }
            }
            if attempt < retries {
                std::thread::sleep(Duration::from_secs_f64(
                    (backoff * f64::from(attempt)).min(2.0),
                ));
            }
        }
        Err(last_error.unwrap_or_else(|| CpmError::upstream("oras command failed")))
    }

    fn enforce_size_limit(&self, files: &[PathBuf]) -> CpmResult<()> {
        let Some(limit) = self.config.max_artifact_size_bytes else {
            return Ok(());
        };
        let mut total = 0u64;
        for file in files {
            total += std::fs::metadata(file)?.len();
        }
        if total > limit {
            return Err(CpmError::policy_deny(format!(
                "artifact size {total} exceeds configured limit {limit} bytes"
            )));
        }
        Ok(())
    }
}

fn walk_files(root: &Path) -> CpmResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn extract_digest(text: &str) -> Option<String> {
    let re = Regex::new(r"sha256:[a-f0-9]{64}").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

#[derive(Debug, Deserialize)]
struct DiscoverEntry {
    #[serde(rename = "artifactType", default)]
    artifact_type: String,
    #[serde(default)]
    annotations: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DiscoverDocument {
    #[serde(default)]
    referrers: Vec<DiscoverEntry>,
    #[serde(default)]
    manifests: Vec<DiscoverEntry>,
}

/// Classify `oras discover` JSON output into evidence flags.
fn classify_referrers(stdout: &str) -> ReferrerEvidence {
    let mut evidence = ReferrerEvidence::default();
    let Ok(document) = serde_json::from_str::<DiscoverDocument>(stdout) else {
        return evidence;
    };
    for entry in document.referrers.iter().chain(document.manifests.iter()) {
        let kind = entry.artifact_type.to_lowercase();
        if kind.contains("signature") || kind.contains("cosign") {
            evidence.signature = true;
        }
        if kind.contains("sbom") || kind.contains("spdx") || kind.contains("cyclonedx") {
            evidence.sbom = true;
        }
        if kind.contains("provenance") || kind.contains("slsa") || kind.contains("in-toto") {
            evidence.provenance = true;
            if evidence.slsa_level.is_none() {
                evidence.slsa_level = entry
                    .annotations
                    .get("slsa.level")
                    .and_then(|v| v.parse().ok());
            }
        }
    }
    evidence
}

/// `repo/cpm/<name>:<version>` reference for a packet.
pub fn package_ref_for(name: &str, version: &str, repository: &str) -> String {
    format!("{}/{name}:{version}", repository.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_extraction() {
        let digest = "sha256:".to_string() + &"a1".repeat(32);
        let text = format!("Pulled {digest} ok");
        assert_eq!(extract_digest(&text), Some(digest));
        assert_eq!(extract_digest("nothing here"), None);
    }

    #[test]
    fn referrer_classification() {
        let stdout = serde_json::json!({
            "referrers": [
                {"artifactType": "application/vnd.dev.cosign.signature.v1+json"},
                {"artifactType": "application/spdx+json"},
                {
                    "artifactType": "application/vnd.in-toto.provenance+json",
                    "annotations": {"slsa.level": "3"}
                }
            ]
        })
        .to_string();
        let evidence = classify_referrers(&stdout);
        assert!(evidence.signature);
        assert!(evidence.sbom);
        assert!(evidence.provenance);
        assert_eq!(evidence.slsa_level, Some(3));
    }

    #[test]
    fn garbage_discover_output_is_empty_evidence() {
        let evidence = classify_referrers("not json at all");
        assert!(!evidence.signature && !evidence.sbom && !evidence.provenance);
    }

    #[test]
    fn package_ref_formatting() {
        assert_eq!(
            package_ref_for("docs", "1.2.0", "registry.local/cpm/"),
            "registry.local/cpm/docs:1.2.0"
        );
    }

    #[test]
    fn allowlist_enforced_before_spawn() {
        let client = OciClient::new(OciClientConfig {
            allowlist_domains: vec!["registry.local".to_string()],
            ..Default::default()
        });
        let err = client.resolve("other.local/cpm/docs:1.0.0").unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::AllowlistViolation);
    }
}
