//! Supply-chain policy evaluation.
//!
//! The policy document (`policy.yml`) gates installs and queries. Denials are
//! checked in a fixed priority order: source allowlist, trust floor, token
//! budget, strict verification failures. An optional remote hub verdict can
//! be merged in by the caller.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::CpmResult;

/// Policy enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Strict,
    Permissive,
}

/// Flat policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyModel {
    #[serde(default)]
    pub mode: PolicyMode,
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub min_trust_score: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

fn default_max_tokens() -> u64 {
    6000
}

impl Default for PolicyModel {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Strict,
            allowed_sources: Vec::new(),
            min_trust_score: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub decision: String,
    pub reason: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PolicyDecision {
    fn deny(reason: &str) -> Self {
        Self {
            allow: false,
            decision: "deny".to_string(),
            reason: reason.to_string(),
            warnings: Vec::new(),
        }
    }
}

/// Wrapper for the `policy:` block in `policy.yml`.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: Option<PolicyModel>,
}

/// Load `policy.yml` from the workspace root; missing or unreadable files
/// yield the default (permissive-by-absence) policy.
pub fn load_policy(workspace_root: &Path) -> PolicyModel {
    let path = workspace_root.join("policy.yml");
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return PolicyModel::default();
    };
    if let Ok(file) = serde_yaml::from_str::<PolicyFile>(&raw) {
        if let Some(policy) = file.policy {
            return policy;
        }
    }
    serde_yaml::from_str::<PolicyModel>(&raw).unwrap_or_default()
}

/// Inputs evaluated against a policy; all optional so callers can gate
/// incrementally (source first, trust after discovery).
#[derive(Debug, Clone, Default)]
pub struct PolicyContext<'a> {
    pub source_uri: Option<&'a str>,
    pub trust_score: Option<f64>,
    pub token_count: Option<u64>,
    pub strict_failures: &'a [String],
}

fn source_matches(pattern: &str, value: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        value.starts_with(prefix)
    } else {
        value == pattern
    }
}

/// Evaluate the policy. Denials come back in priority order.
pub fn evaluate_policy(policy: &PolicyModel, ctx: &PolicyContext<'_>) -> PolicyDecision {
    if let Some(source) = ctx.source_uri {
        if !policy.allowed_sources.is_empty()
            && !policy
                .allowed_sources
                .iter()
                .any(|p| source_matches(p, source))
        {
            return PolicyDecision::deny("source_not_allowlisted");
        }
    }
    if let Some(score) = ctx.trust_score {
        if score < policy.min_trust_score {
            return PolicyDecision::deny("trust_score_below_threshold");
        }
    }
    if let Some(tokens) = ctx.token_count {
        if tokens > policy.max_tokens {
            return PolicyDecision::deny("token_budget_exceeded");
        }
    }
    let mut warnings = Vec::new();
    if !ctx.strict_failures.is_empty() {
        if policy.mode == PolicyMode::Strict {
            return PolicyDecision::deny("strict_verification_failed");
        }
        warnings.push("strict_failures_ignored".to_string());
    }
    if !warnings.is_empty() {
        return PolicyDecision {
            allow: true,
            decision: "warn".to_string(),
            reason: "policy_warning".to_string(),
            warnings,
        };
    }
    PolicyDecision {
        allow: true,
        decision: "allow".to_string(),
        reason: "ok".to_string(),
        warnings: Vec::new(),
    }
}

/// Persist a policy document (used by tests and `cpm doctor --init`).
pub fn write_policy(workspace_root: &Path, policy: &PolicyModel) -> CpmResult<()> {
    let file = serde_yaml::to_string(&PolicyFileOut {
        policy: policy.clone(),
    })?;
    std::fs::write(workspace_root.join("policy.yml"), file)?;
    Ok(())
}

#[derive(Serialize)]
struct PolicyFileOut {
    policy: PolicyModel,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicyModel {
        PolicyModel {
            mode: PolicyMode::Strict,
            allowed_sources: vec!["oci://registry.local/*".to_string()],
            min_trust_score: 0.8,
            max_tokens: 100,
        }
    }

    #[test]
    fn source_allowlist_deny_comes_first() {
        let p = policy();
        let d = evaluate_policy(
            &p,
            &PolicyContext {
                source_uri: Some("oci://other.local/foo@1.0.0"),
                trust_score: Some(0.0),
                ..Default::default()
            },
        );
        assert!(!d.allow);
        assert_eq!(d.reason, "source_not_allowlisted");
    }

    #[test]
    fn trust_floor() {
        let p = policy();
        let d = evaluate_policy(
            &p,
            &PolicyContext {
                source_uri: Some("oci://registry.local/foo@1.0.0"),
                trust_score: Some(0.33),
                ..Default::default()
            },
        );
        assert_eq!(d.reason, "trust_score_below_threshold");
    }

    #[test]
    fn token_budget() {
        let p = policy();
        let d = evaluate_policy(
            &p,
            &PolicyContext {
                token_count: Some(101),
                ..Default::default()
            },
        );
        assert_eq!(d.reason, "token_budget_exceeded");
    }

    #[test]
    fn strict_failures_warn_in_permissive() {
        let mut p = policy();
        p.mode = PolicyMode::Permissive;
        let failures = vec!["signature".to_string()];
        let d = evaluate_policy(
            &p,
            &PolicyContext {
                strict_failures: &failures,
                ..Default::default()
            },
        );
        assert!(d.allow);
        assert_eq!(d.decision, "warn");
        assert_eq!(d.warnings, vec!["strict_failures_ignored"]);
    }

    #[test]
    fn loads_policy_block() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.yml"),
            "policy:\n  mode: permissive\n  min_trust_score: 0.5\n  allowed_sources:\n    - \"oci://r/*\"\n",
        )
        .unwrap();
        let p = load_policy(dir.path());
        assert_eq!(p.mode, PolicyMode::Permissive);
        assert_eq!(p.min_trust_score, 0.5);
        assert_eq!(p.allowed_sources, vec!["oci://r/*"]);
    }

    #[test]
    fn missing_policy_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let p = load_policy(dir.path());
        assert_eq!(p.max_tokens, 6000);
        assert!(p.allowed_sources.is_empty());
    }
}
