//! Security helpers for OCI refs, logged commands and extraction paths,
//! plus trust-report evaluation over discovered referrers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cpm_core::errors::{CpmError, CpmResult};

const SENSITIVE_KEYS: [&str; 4] = ["password", "token", "authorization", "bearer"];

/// Registry host of an OCI reference (`host/repo[:tag][@digest]`).
pub fn host_from_ref(r#ref: &str) -> CpmResult<String> {
    let value = r#ref.trim();
    if value.is_empty() {
        return Err(CpmError::allowlist_violation("empty OCI reference"));
    }
    let host = value.split('/').next().unwrap_or("").trim();
    if host.is_empty() {
        return Err(CpmError::allowlist_violation(format!(
            "invalid OCI reference: {value:?}"
        )));
    }
    Ok(host.to_lowercase())
}

/// Enforce the host allowlist. A host matches when it equals an allowed
/// domain or is a subdomain of one. An empty allowlist allows everything.
pub fn assert_allowlisted(r#ref: &str, allowlist_domains: &[String]) -> CpmResult<()> {
    if allowlist_domains.is_empty() {
        return Ok(());
    }
    let host = host_from_ref(r#ref)?;
    for allowed in allowlist_domains {
        let key = allowed.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        if host == key || host.ends_with(&format!(".{key}")) {
            return Ok(());
        }
    }
    Err(CpmError::allowlist_violation(format!(
        "registry host '{host}' is not in OCI allowlist"
    )))
}

/// Resolve an extraction path and reject traversal outside `base_dir`.
pub fn safe_output_path(base_dir: &Path, relative_path: &str) -> CpmResult<PathBuf> {
    use std::path::Component;
    let rel = Path::new(relative_path);
    if rel.is_absolute() {
        return Err(CpmError::path_traversal(format!(
            "absolute path in archive entry: {relative_path}"
        )));
    }
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CpmError::path_traversal(format!(
                    "path traversal blocked for extracted path: {relative_path}"
                )))
            }
        }
    }
    Ok(base_dir.join(clean))
}

/// Redact secrets from a command line before logging it.
pub fn redact_command_for_log(command: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(command.len());
    let mut skip_next = false;
    for item in command {
        if skip_next {
            out.push("***".to_string());
            skip_next = false;
            continue;
        }
        let lower = item.to_lowercase();
        if lower == "--password" || lower == "--token" {
            out.push(item.clone());
            skip_next = true;
            continue;
        }
        if SENSITIVE_KEYS.iter().any(|key| lower.contains(key)) {
            out.push("***".to_string());
            continue;
        }
        if item.contains("://") {
            if let Ok(mut parsed) = url::Url::parse(item) {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                    out.push(parsed.to_string());
                    continue;
                }
            }
        }
        out.push(item.clone());
    }
    out
}

/// Verification evidence attached to an OCI artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferrerEvidence {
    pub signature: bool,
    pub sbom: bool,
    pub provenance: bool,
    pub slsa_level: Option<u32>,
}

/// Aggregated trust verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustReport {
    pub signature_valid: bool,
    pub sbom_present: bool,
    pub provenance_present: bool,
    pub slsa_level: Option<u32>,
    /// Fraction of present evidence kinds, in `[0, 1]`.
    pub trust_score: f64,
    /// Required-but-missing evidence kinds under strict settings.
    pub strict_failures: Vec<String>,
}

/// Score evidence and collect strict failures.
pub fn evaluate_trust_report(
    evidence: &ReferrerEvidence,
    strict: bool,
    require_signature: bool,
    require_sbom: bool,
    require_provenance: bool,
) -> TrustReport {
    let mut present = 0u32;
    for flag in [evidence.signature, evidence.sbom, evidence.provenance] {
        if flag {
            present += 1;
        }
    }
    let trust_score = (f64::from(present) / 3.0 * 100.0).round() / 100.0;

    let mut strict_failures = Vec::new();
    if strict {
        if require_signature && !evidence.signature {
            strict_failures.push("signature".to_string());
        }
        if require_sbom && !evidence.sbom {
            strict_failures.push("sbom".to_string());
        }
        if require_provenance && !evidence.provenance {
            strict_failures.push("provenance".to_string());
        }
    }

    TrustReport {
        signature_valid: evidence.signature,
        sbom_present: evidence.sbom,
        provenance_present: evidence.provenance,
        slsa_level: evidence.slsa_level,
        trust_score,
        strict_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_matches_exact_and_subdomain() {
        let allow = vec!["registry.local".to_string()];
        assert!(assert_allowlisted("registry.local/cpm/docs:1.0.0", &allow).is_ok());
        assert!(assert_allowlisted("mirror.registry.local/cpm/docs:1.0.0", &allow).is_ok());
        assert!(assert_allowlisted("other.local/cpm/docs:1.0.0", &allow).is_err());
        assert!(assert_allowlisted("anything/cpm", &[]).is_ok());
    }

    #[test]
    fn traversal_blocked() {
        let base = Path::new("/tmp/out");
        assert!(safe_output_path(base, "payload/docs.jsonl").is_ok());
        assert!(safe_output_path(base, "../escape").is_err());
        assert!(safe_output_path(base, "/abs/path").is_err());
    }

    #[test]
    fn redaction_masks_secret_flags_and_userinfo() {
        let cmd: Vec<String> = [
            "oras", "pull", "--token", "s3cret", "https://user:pw@host/repo",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        let redacted = redact_command_for_log(&cmd);
        assert_eq!(redacted[3], "***");
        assert!(!redacted[4].contains("pw@"));
        assert!(redacted[4].contains("***"));
    }

    #[test]
    fn trust_scores_by_thirds() {
        let report = evaluate_trust_report(
            &ReferrerEvidence {
                signature: true,
                ..Default::default()
            },
            false,
            true,
            true,
            true,
        );
        assert!((report.trust_score - 0.33).abs() < 1e-9);
        assert!(report.strict_failures.is_empty());

        let report = evaluate_trust_report(
            &ReferrerEvidence {
                signature: true,
                sbom: true,
                provenance: true,
                slsa_level: Some(3),
            },
            true,
            true,
            true,
            true,
        );
        assert!((report.trust_score - 1.0).abs() < 1e-9);
        assert!(report.strict_failures.is_empty());
    }

    #[test]
    fn strict_mode_collects_missing_evidence() {
        let report = evaluate_trust_report(
            &ReferrerEvidence {
                sbom: true,
                ..Default::default()
            },
            true,
            true,
            true,
            false,
        );
        assert_eq!(report.strict_failures, vec!["signature"]);
    }
}
