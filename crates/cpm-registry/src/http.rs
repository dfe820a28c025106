//! Packet registry HTTP client.
//!
//! Speaks the registry's package API:
//! - `HEAD /v1/packages/{name}/{version}` (existence)
//! - `GET  /v1/packages/{name}` (version listing)
//! - `POST /v1/packages/{name}/{version}` (multipart publish)
//! - `GET  /v1/packages/{name}/{version}/download` (archive download)

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use cpm_core::errors::{CpmError, CpmResult};

/// One listed package version.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteVersion {
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    versions: Vec<RemoteVersion>,
}

/// Blocking registry API client.
pub struct RegistryHttpClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl RegistryHttpClient {
    pub fn new(base_url: &str, timeout_seconds: f64) -> CpmResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_seconds.max(1.0)))
            .build()
            .map_err(|e| CpmError::invalid_config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn exists(&self, name: &str, version: &str) -> CpmResult<bool> {
        let url = format!("{}/v1/packages/{name}/{version}", self.base_url);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(map_transport_error)?;
        Ok(response.status().is_success())
    }

    pub fn list_versions(&self, name: &str) -> CpmResult<Vec<RemoteVersion>> {
        let url = format!("{}/v1/packages/{name}", self.base_url);
        let response = self.client.get(&url).send().map_err(map_transport_error)?;
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(CpmError::upstream(format!(
                "registry listing failed: status={}",
                response.status()
            )));
        }
        let listing: ListResponse = response
            .json()
            .map_err(|e| CpmError::upstream(format!("registry listing body: {e}")))?;
        Ok(listing.versions)
    }

    /// Publish a packet archive via multipart upload.
    pub fn publish(&self, name: &str, version: &str, archive: &Path) -> CpmResult<()> {
        let url = format!("{}/v1/packages/{name}/{version}", self.base_url);
        let form = reqwest::blocking::multipart::Form::new()
            .file("archive", archive)
            .map_err(|e| CpmError::io(format!("publish payload: {e}")))?;
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(CpmError::upstream(format!(
                "publish failed: status={} body={}",
                response.status(),
                response.text().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Download the packet archive to `target`.
    pub fn download(&self, name: &str, version: &str, target: &Path) -> CpmResult<()> {
        let url = format!("{}/v1/packages/{name}/{version}/download", self.base_url);
        let response = self.client.get(&url).send().map_err(map_transport_error)?;
        if response.status().as_u16() == 404 {
            return Err(CpmError::packet_not_found(format!(
                "{name}@{version} is not published"
            )));
        }
        if !response.status().is_success() {
            return Err(CpmError::upstream(format!(
                "download failed: status={}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|e| CpmError::upstream(format!("download body: {e}")))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, &bytes)?;
        Ok(())
    }
}

fn map_transport_error(e: reqwest::Error) -> CpmError {
    if e.is_timeout() {
        CpmError::timeout(format!("registry request timed out: {e}"))
    } else {
        CpmError::upstream(format!("registry unreachable: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = RegistryHttpClient::new("http://registry.local/", 5.0).unwrap();
        assert_eq!(client.base_url, "http://registry.local");
    }

    #[test]
    fn unreachable_registry_maps_to_upstream_error() {
        let client = RegistryHttpClient::new("http://127.0.0.1:1", 1.0).unwrap();
        let err = client.exists("docs", "1.0.0").unwrap_err();
        assert!(matches!(
            err.kind,
            cpm_core::errors::ErrorKind::UpstreamError | cpm_core::errors::ErrorKind::Timeout
        ));
    }
}
