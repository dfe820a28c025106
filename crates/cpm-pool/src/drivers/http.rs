//! HTTP driver: forwards to another pool-shaped `/embed` endpoint.

use std::time::Duration;

use serde::Deserialize;

use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::matrix::Matrix;

use crate::types::EmbedRequestOptions;

use super::EmbedDriver;

#[derive(Debug, Deserialize)]
struct EmbedResponseBody {
    vectors: Vec<Vec<f32>>,
}

pub struct HttpDriver {
    base_url: String,
    remote_model: String,
    client: reqwest::blocking::Client,
    dim: usize,
}

impl HttpDriver {
    pub fn new(base_url: String, remote_model: String, timeout_s: Option<f64>) -> CpmResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_s.unwrap_or(120.0).max(1.0)))
            .build()
            .map_err(|e| CpmError::invalid_config(format!("http driver client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            remote_model,
            client,
            dim: 0,
        })
    }
}

impl EmbedDriver for HttpDriver {
    fn warmup(&mut self) -> CpmResult<()> {
        Ok(())
    }

    fn embed(&mut self, texts: &[String], options: &EmbedRequestOptions) -> CpmResult<Matrix> {
        let payload = serde_json::json!({
            "model": self.remote_model,
            "texts": texts,
            "options": options,
        });
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&payload)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    CpmError::timeout(format!("http driver: {e}"))
                } else {
                    CpmError::upstream(format!("http driver: {e}"))
                }
            })?;
        if !response.status().is_success() {
            return Err(CpmError::upstream(format!(
                "http driver: upstream returned status {}",
                response.status()
            )));
        }
        let body: EmbedResponseBody = response
            .json()
            .map_err(|e| CpmError::upstream(format!("http driver body: {e}")))?;
        let matrix = Matrix::from_rows(&body.vectors)?;
        self.dim = matrix.dim();
        Ok(matrix)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
