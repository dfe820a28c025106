//! Remote policy hub client.
//!
//! Forwards `{context, policy}` to `POST <hub>/v1/policy/evaluate`. When
//! `enforce_remote_policy` is set, an unreachable hub or a malformed reply
//! becomes a deny; otherwise remote evaluation is advisory and failures
//! yield `None`.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

/// `[hub]` settings from `config.toml`.
#[derive(Debug, Clone, Default)]
pub struct HubSettings {
    pub base_url: Option<String>,
    pub enforce_remote_policy: bool,
    pub timeout_seconds: f64,
}

/// Remote policy evaluator.
pub struct HubClient {
    settings: HubSettings,
    client: reqwest::blocking::Client,
}

impl HubClient {
    pub fn new(settings: HubSettings) -> Self {
        let timeout = Duration::from_secs_f64(settings.timeout_seconds.max(1.0));
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { settings, client }
    }

    /// Evaluate remotely. `None` means "no remote verdict" (unconfigured, or
    /// unreachable in advisory mode).
    pub fn evaluate_policy(&self, context: &Value, policy: &Value) -> Option<Value> {
        let base = self.settings.base_url.as_deref()?.trim_end_matches('/');
        let endpoint = format!("{base}/v1/policy/evaluate");
        let body = serde_json::json!({"context": context, "policy": policy});

        let response = match self.client.post(&endpoint).json(&body).send() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "policy hub unreachable");
                return self.deny_or_none("hub_unreachable");
            }
        };
        match response.json::<Value>() {
            Ok(Value::Object(map)) => Some(Value::Object(map)),
            Ok(_) | Err(_) => self.deny_or_none("hub_invalid_response"),
        }
    }

    fn deny_or_none(&self, reason: &str) -> Option<Value> {
        if !self.settings.enforce_remote_policy {
            return None;
        }
        Some(serde_json::json!({
            "allow": false,
            "decision": "deny",
            "reason": reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_hub_yields_no_verdict() {
        let hub = HubClient::new(HubSettings::default());
        assert!(hub
            .evaluate_policy(&serde_json::json!({}), &serde_json::json!({}))
            .is_none());
    }

    #[test]
    fn unreachable_hub_denies_when_enforced() {
        let hub = HubClient::new(HubSettings {
            base_url: Some("http://127.0.0.1:1".to_string()),
            enforce_remote_policy: true,
            timeout_seconds: 1.0,
        });
        let verdict = hub
            .evaluate_policy(&serde_json::json!({}), &serde_json::json!({}))
            .unwrap();
        assert_eq!(verdict["allow"], false);
        assert_eq!(verdict["reason"], "hub_unreachable");
    }

    #[test]
    fn unreachable_hub_is_advisory_by_default() {
        let hub = HubClient::new(HubSettings {
            base_url: Some("http://127.0.0.1:1".to_string()),
            enforce_remote_policy: false,
            timeout_seconds: 1.0,
        });
        assert!(hub
            .evaluate_policy(&serde_json::json!({}), &serde_json::json!({}))
            .is_none());
    }
}
