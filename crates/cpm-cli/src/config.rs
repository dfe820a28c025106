//! Workspace configuration files: `config.toml`, `build.toml`,
//! `embeddings.yml`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cpm_core::build::{ArchiveFormat, BuilderConfig};
use cpm_core::errors::{CpmError, CpmResult};
use cpm_registry::{HubSettings, OciClientConfig};
use cpm_store::WorkspaceLayout;

// ---------------------------------------------------------------------------
// config.toml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciSection {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_seconds: Option<f64>,
    #[serde(default)]
    pub insecure: Option<bool>,
    #[serde(default)]
    pub allowlist_domains: Vec<String>,
    #[serde(default)]
    pub max_artifact_size_bytes: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub strict_verify: bool,
    #[serde(default = "default_true")]
    pub require_signature: bool,
    #[serde(default = "default_true")]
    pub require_sbom: bool,
    #[serde(default = "default_true")]
    pub require_provenance: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub enforce_remote_policy: bool,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySection {
    /// Packet registry HTTP base URL (list-remote / publish / update).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub oci: OciSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub registry: RegistrySection,
}

impl CliConfig {
    pub fn load(layout: &WorkspaceLayout) -> Self {
        let path = layout.config_file();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        toml::from_str(&raw).unwrap_or_default()
    }

    pub fn oci_client_config(&self, insecure_flag: bool) -> OciClientConfig {
        OciClientConfig {
            timeout_seconds: self.oci.timeout_seconds.unwrap_or(30.0),
            max_retries: self.oci.max_retries.unwrap_or(2),
            backoff_seconds: self.oci.backoff_seconds.unwrap_or(0.2),
            insecure: insecure_flag || self.oci.insecure.unwrap_or(false),
            allowlist_domains: self.oci.allowlist_domains.clone(),
            max_artifact_size_bytes: self.oci.max_artifact_size_bytes,
            username: self.oci.username.clone(),
            password: self.oci.password.clone(),
            token: self.oci.token.clone(),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            base_url: self.hub.url.clone(),
            enforce_remote_policy: self.hub.enforce_remote_policy,
            timeout_seconds: self.hub.timeout_seconds.unwrap_or(5.0),
        }
    }
}

// ---------------------------------------------------------------------------
// build.toml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSourceSection {
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildOutputSection {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub archive: Option<bool>,
    #[serde(default)]
    pub archive_format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildEmbeddingSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_seq_length: Option<u32>,
    #[serde(default)]
    pub embed_url: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildChunkingSection {
    #[serde(default)]
    pub lines_per_chunk: Option<usize>,
    #[serde(default)]
    pub overlap_lines: Option<usize>,
    #[serde(default)]
    pub chunk_tokens: Option<usize>,
    #[serde(default)]
    pub overlap_tokens: Option<usize>,
    #[serde(default)]
    pub hierarchical: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildFileConfig {
    #[serde(default)]
    pub source: BuildSourceSection,
    #[serde(default)]
    pub output: BuildOutputSection,
    #[serde(default)]
    pub embedding: BuildEmbeddingSection,
    #[serde(default)]
    pub chunking: BuildChunkingSection,
}

impl BuildFileConfig {
    pub fn load(layout: &WorkspaceLayout) -> Self {
        let path = layout.build_config_file();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        toml::from_str(&raw).unwrap_or_default()
    }

    /// Merge file config into a BuilderConfig.
    pub fn builder_config(&self) -> CpmResult<BuilderConfig> {
        let mut config = BuilderConfig::default();
        if let Some(model) = &self.embedding.model {
            config.model_name = model.clone();
        }
        if let Some(max_seq) = self.embedding.max_seq_length {
            config.max_seq_length = max_seq;
            config.chunking.hard_cap_tokens = Some(max_seq.saturating_sub(32) as usize);
        }
        if let Some(url) = &self.embedding.embed_url {
            config.embed_url = url.clone();
        }
        if let Some(version) = &self.output.version {
            config.version = version.clone();
        }
        if let Some(archive) = self.output.archive {
            config.archive = archive;
        }
        if let Some(format) = &self.output.archive_format {
            config.archive_format = ArchiveFormat::parse(format)?;
        }
        if let Some(v) = self.chunking.lines_per_chunk {
            config.chunking.lines_per_chunk = v;
        }
        if let Some(v) = self.chunking.overlap_lines {
            config.chunking.overlap_lines = v;
        }
        if let Some(v) = self.chunking.chunk_tokens {
            config.chunking.chunk_tokens = v;
        }
        if let Some(v) = self.chunking.overlap_tokens {
            config.chunking.overlap_tokens = v;
        }
        if let Some(v) = self.chunking.hierarchical {
            config.chunking.hierarchical = v;
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// embeddings.yml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderAuth {
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderHttp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingProvider {
    pub r#type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProviderAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<ProviderHttp>,
    /// Optional OCI model artifact policy: `{source: "oci", ref_template}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_artifacts: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, EmbeddingProvider>,
}

impl EmbeddingsConfig {
    pub fn load(layout: &WorkspaceLayout) -> Self {
        let path = layout.embeddings_file();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_yaml::from_str(&raw).unwrap_or_default()
    }

    pub fn save(&self, layout: &WorkspaceLayout) -> CpmResult<()> {
        let path = layout.embeddings_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self).map_err(CpmError::from)?)?;
        Ok(())
    }

    pub fn default_provider(&self) -> Option<(&String, &EmbeddingProvider)> {
        let name = self.default.as_ref()?;
        self.providers.get_key_value(name)
    }

    pub fn get(&self, name: &str) -> CpmResult<&EmbeddingProvider> {
        self.providers.get(name).ok_or_else(|| {
            CpmError::invalid_config(format!("embedding provider '{name}' is not configured"))
        })
    }

    /// Discover models a provider serves (`GET <url><models_path>`). Accepts
    /// both OpenAI (`data[].id`) and plain (`models[]`) listings.
    pub fn discover_models(&self, provider: &EmbeddingProvider) -> Vec<String> {
        let models_path = provider
            .http
            .as_ref()
            .and_then(|h| h.models_path.clone())
            .unwrap_or_else(|| "/v1/models".to_string());
        let url = format!("{}{models_path}", provider.url.trim_end_matches('/'));
        let client = match reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs_f64(
                provider.timeout.unwrap_or(5.0).max(1.0),
            ))
            .build()
        {
            Ok(client) => client,
            Err(_) => return Vec::new(),
        };
        let Ok(response) = client.get(&url).send() else {
            return Vec::new();
        };
        let Ok(body) = response.json::<Value>() else {
            return Vec::new();
        };
        if let Some(data) = body.get("data").and_then(|d| d.as_array()) {
            return data
                .iter()
                .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                .map(String::from)
                .collect();
        }
        if let Some(models) = body.get("models").and_then(|m| m.as_array()) {
            return models
                .iter()
                .filter_map(|m| m.as_str().map(String::from).or_else(|| {
                    m.get("model").and_then(|v| v.as_str()).map(String::from)
                }))
                .collect();
        }
        Vec::new()
    }
}

/// Load a file's config.toml-equivalent from an arbitrary path (tests).
pub fn load_cli_config_from(path: &Path) -> CliConfig {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return CliConfig::default();
    };
    toml::from_str(&raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_toml_sections_parse() {
        let raw = r#"
[oci]
repository = "registry.local/cpm"
allowlist_domains = ["registry.local"]
strict_verify = false

[hub]
url = "http://hub.local"
enforce_remote_policy = true

[registry]
url = "http://registry.local:8080"
"#;
        let config: CliConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.oci.repository.as_deref(), Some("registry.local/cpm"));
        assert!(!config.oci.strict_verify);
        assert!(config.oci.require_signature);
        assert!(config.hub.enforce_remote_policy);
        assert_eq!(config.registry.url.as_deref(), Some("http://registry.local:8080"));
    }

    #[test]
    fn build_toml_maps_to_builder_config() {
        let raw = r#"
[source]
dir = "docs"

[output]
dir = "out"
version = "1.2.3"
archive = true
archive_format = "zip"

[embedding]
model = "m"
max_seq_length = 512

[chunking]
lines_per_chunk = 40
overlap_lines = 5
"#;
        let file: BuildFileConfig = toml::from_str(raw).unwrap();
        let config = file.builder_config().unwrap();
        assert_eq!(config.model_name, "m");
        assert_eq!(config.version, "1.2.3");
        assert_eq!(config.chunking.hard_cap_tokens, Some(480));
        assert_eq!(config.chunking.lines_per_chunk, 40);
        assert!(config.archive);
    }

    #[test]
    fn embeddings_yaml_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(tmp.path().join(".cpm"));
        layout.ensure().unwrap();

        let mut config = EmbeddingsConfig::default();
        config.providers.insert(
            "pool".to_string(),
            EmbeddingProvider {
                r#type: "http".to_string(),
                url: "http://127.0.0.1:8876".to_string(),
                model: Some("m".to_string()),
                ..Default::default()
            },
        );
        config.default = Some("pool".to_string());
        config.save(&layout).unwrap();

        let back = EmbeddingsConfig::load(&layout);
        assert_eq!(back.default.as_deref(), Some("pool"));
        let (name, provider) = back.default_provider().unwrap();
        assert_eq!(name, "pool");
        assert_eq!(provider.url, "http://127.0.0.1:8876");
    }
}
