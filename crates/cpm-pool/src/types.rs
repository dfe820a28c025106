//! Pool configuration types (`pool.yml`, `config.yml`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cpm_core::errors::{CpmError, CpmResult};

/// How a model computes embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverType {
    /// In-process runtime.
    LocalSt,
    /// Remote pool-shaped HTTP endpoint.
    Http,
    /// Long-lived JSON-lines worker process.
    Subprocess,
}

/// Driver selection plus its free-form configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSpec {
    pub r#type: DriverType,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

impl Default for DriverSpec {
    fn default() -> Self {
        Self {
            r#type: DriverType::LocalSt,
            config: BTreeMap::new(),
        }
    }
}

/// Replica autoscaling bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalingSpec {
    #[serde(default = "default_min")]
    pub min: u32,
    #[serde(default = "default_max")]
    pub max: u32,
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_s: u64,
}

fn default_min() -> u32 {
    1
}
fn default_max() -> u32 {
    1
}
fn default_idle_ttl() -> u64 {
    30
}

impl Default for ScalingSpec {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            idle_ttl_s: default_idle_ttl(),
        }
    }
}

/// Queue bounds per model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueSpec {
    #[serde(default = "default_queue_size")]
    pub max_size: usize,
    #[serde(default = "default_inflight")]
    pub max_inflight_per_replica: u32,
}

fn default_queue_size() -> usize {
    1000
}
fn default_inflight() -> u32 {
    1
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            max_size: default_queue_size(),
            max_inflight_per_replica: default_inflight(),
        }
    }
}

/// One model registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub driver: DriverSpec,
    #[serde(default)]
    pub scaling: ScalingSpec,
    #[serde(default)]
    pub queue: QueueSpec,
}

fn default_enabled() -> bool {
    true
}

impl ModelSpec {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            alias: None,
            enabled: true,
            driver: DriverSpec::default(),
            scaling: ScalingSpec::default(),
            queue: QueueSpec::default(),
        }
    }
}

/// The `pool.yml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFile {
    #[serde(default = "default_pool_version")]
    pub version: u32,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

fn default_pool_version() -> u32 {
    1
}

impl Default for PoolFile {
    fn default() -> Self {
        Self {
            version: default_pool_version(),
            models: Vec::new(),
        }
    }
}

impl PoolFile {
    /// Reject two models claiming the same alias.
    pub fn check_alias_conflicts(&self) -> CpmResult<()> {
        let mut used: BTreeMap<&str, &str> = BTreeMap::new();
        for spec in &self.models {
            let Some(alias) = spec.alias.as_deref() else {
                continue;
            };
            if let Some(owner) = used.get(alias) {
                if *owner != spec.model {
                    return Err(CpmError::invalid_config(format!(
                        "alias conflict: {alias} used by {owner} and {}",
                        spec.model
                    )));
                }
            }
            used.insert(alias, &spec.model);
        }
        Ok(())
    }

    /// Resolve a model name or alias to the canonical model name.
    pub fn resolve_model(&self, name_or_alias: &str) -> Option<&ModelSpec> {
        let wanted = name_or_alias.trim();
        self.models
            .iter()
            .find(|m| m.model == wanted)
            .or_else(|| {
                self.models
                    .iter()
                    .find(|m| m.alias.as_deref() == Some(wanted))
            })
    }
}

/// Load `pool.yml`; a missing file yields an empty pool.
pub fn load_pool(path: &Path) -> CpmResult<PoolFile> {
    if !path.exists() {
        return Ok(PoolFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CpmError::io(format!("unable to read {}: {e}", path.display())))?;
    let pool: PoolFile = serde_yaml::from_str(&raw)
        .map_err(|e| CpmError::invalid_config(format!("{}: {e}", path.display())))?;
    Ok(pool)
}

pub fn save_pool(path: &Path, pool: &PoolFile) -> CpmResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(pool)?)?;
    Ok(())
}

/// Server configuration (`config.yml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_pool_yml")]
    pub pool_yml: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_s: u64,
    #[serde(default = "default_inflight_global")]
    pub max_inflight_global: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8876
}
fn default_pool_yml() -> PathBuf {
    PathBuf::from(".config/pool.yml")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".config/cache")
}
fn default_request_timeout() -> u64 {
    120
}
fn default_inflight_global() -> usize {
    256
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            server_host: default_host(),
            server_port: default_port(),
            pool_yml: default_pool_yml(),
            cache_dir: default_cache_dir(),
            request_timeout_s: default_request_timeout(),
            max_inflight_global: default_inflight_global(),
        }
    }
}

impl PoolConfig {
    pub fn load(path: &Path) -> CpmResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CpmError::io(format!("unable to read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| CpmError::invalid_config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }
}

/// Options accepted by `/embed` requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedRequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seq_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_progress: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_yaml_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pool.yml");
        let mut pool = PoolFile::default();
        let mut spec = ModelSpec::new("jina-code");
        spec.alias = Some("code".to_string());
        spec.driver.r#type = DriverType::Subprocess;
        pool.models.push(spec);
        save_pool(&path, &pool).unwrap();

        let back = load_pool(&path).unwrap();
        assert_eq!(back.models.len(), 1);
        assert_eq!(back.models[0].alias.as_deref(), Some("code"));
        assert_eq!(back.models[0].driver.r#type, DriverType::Subprocess);
        assert_eq!(back.models[0].scaling.min, 1);
    }

    #[test]
    fn missing_pool_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = load_pool(&tmp.path().join("absent.yml")).unwrap();
        assert!(pool.models.is_empty());
        assert_eq!(pool.version, 1);
    }

    #[test]
    fn alias_conflicts_detected() {
        let mut pool = PoolFile::default();
        let mut a = ModelSpec::new("model-a");
        a.alias = Some("x".to_string());
        let mut b = ModelSpec::new("model-b");
        b.alias = Some("x".to_string());
        pool.models = vec![a, b];
        assert!(pool.check_alias_conflicts().is_err());
    }

    #[test]
    fn alias_resolution() {
        let mut pool = PoolFile::default();
        let mut a = ModelSpec::new("model-a");
        a.alias = Some("x".to_string());
        pool.models = vec![a];
        assert_eq!(pool.resolve_model("model-a").unwrap().model, "model-a");
        assert_eq!(pool.resolve_model("x").unwrap().model, "model-a");
        assert!(pool.resolve_model("y").is_none());
    }

    #[test]
    fn driver_type_snake_case() {
        assert_eq!(
            serde_yaml::to_string(&DriverType::LocalSt).unwrap().trim(),
            "local_st"
        );
    }
}
