//! Embedding drivers.
//!
//! A driver is the concrete means of computing embeddings for one model.
//! Drivers are blocking; replicas call them from worker threads. One replica
//! owns one driver exclusively, so `&mut self` suffices for request/response
//! pairing.

pub mod http;
pub mod local;
pub mod subprocess;

use serde_json::Value;
use std::collections::BTreeMap;

use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::matrix::Matrix;

use crate::types::{DriverSpec, DriverType, EmbedRequestOptions};

/// One model's embedding backend.
pub trait EmbedDriver: Send {
    /// Prepare the backend (load weights, spawn the worker, ...).
    fn warmup(&mut self) -> CpmResult<()>;

    /// Embed texts; must return one f32 row per input, in input order.
    fn embed(&mut self, texts: &[String], options: &EmbedRequestOptions) -> CpmResult<Matrix>;

    /// Last observed output width (0 when unknown).
    fn dim(&self) -> usize;

    /// Release resources. Default is a no-op.
    fn close(&mut self) {}
}

fn config_str(config: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn config_f64(config: &BTreeMap<String, Value>, key: &str) -> Option<f64> {
    config.get(key).and_then(|v| v.as_f64())
}

/// Build a driver from its spec.
pub fn build_driver(model_name: &str, spec: &DriverSpec) -> CpmResult<Box<dyn EmbedDriver>> {
    match spec.r#type {
        DriverType::LocalSt => {
            let dim = spec
                .config
                .get("dim")
                .and_then(|v| v.as_u64())
                .unwrap_or(384) as usize;
            Ok(Box::new(local::LocalDriver::new(model_name, dim)))
        }
        DriverType::Http => {
            let base_url = config_str(&spec.config, "base_url").ok_or_else(|| {
                CpmError::invalid_config("http driver requires config.base_url")
            })?;
            let remote_model =
                config_str(&spec.config, "remote_model").unwrap_or_else(|| model_name.to_string());
            let timeout_s = config_f64(&spec.config, "timeout_s");
            Ok(Box::new(http::HttpDriver::new(
                base_url,
                remote_model,
                timeout_s,
            )?))
        }
        DriverType::Subprocess => {
            let cmd: Vec<String> = match spec.config.get("cmd") {
                Some(Value::String(s)) => s
                    .split_whitespace()
                    .map(String::from)
                    .collect(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect(),
                _ => Vec::new(),
            };
            if cmd.is_empty() {
                return Err(CpmError::invalid_config(
                    "subprocess driver requires config.cmd",
                ));
            }
            let env: BTreeMap<String, String> = spec
                .config
                .get("env")
                .and_then(|v| v.as_object())
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            let startup_timeout_s = config_f64(&spec.config, "startup_timeout_s").unwrap_or(60.0);
            let timeout_s = config_f64(&spec.config, "timeout_s").unwrap_or(120.0);
            let cwd = config_str(&spec.config, "cwd");
            Ok(Box::new(subprocess::SubprocessDriver::new(
                model_name,
                cmd,
                cwd,
                env,
                startup_timeout_s,
                timeout_s,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_is_default_and_needs_no_config() {
        let driver = build_driver("m", &DriverSpec::default()).unwrap();
        assert_eq!(driver.dim(), 384);
    }

    #[test]
    fn http_requires_base_url() {
        let spec = DriverSpec {
            r#type: DriverType::Http,
            config: BTreeMap::new(),
        };
        assert!(build_driver("m", &spec).is_err());
    }

    #[test]
    fn subprocess_requires_cmd() {
        let spec = DriverSpec {
            r#type: DriverType::Subprocess,
            config: BTreeMap::new(),
        };
        assert!(build_driver("m", &spec).is_err());
    }
}
