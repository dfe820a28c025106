//! Embedder clients.
//!
//! Two wire shapes are supported behind one `embed_texts` surface:
//! - the internal pool `/embed` endpoint
//! - OpenAI-shaped `/v1/embeddings`
//!
//! Batching is adaptive: a configured `input_size` caps batch rows, and the
//! batch halves on rate limiting, timeouts or the upstream's "too many input
//! items" complaint. Transient failures retry with capped exponential
//! backoff, honoring `Retry-After`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cpm_core::build::{EmbedOptions, Embedder, VectorDtype};
use cpm_core::errors::{CpmError, CpmResult, ErrorKind};
use cpm_core::matrix::Matrix;

use crate::types::EmbedRequestOptions;

const BACKOFF_BASE_S: f64 = 0.1;
const BACKOFF_CAP_S: f64 = 1.0;

/// Which endpoint shape the uniform client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    /// Internal pool `/embed`.
    Pool,
    /// OpenAI-shaped `/v1/embeddings`.
    OpenAi,
}

impl EmbedMode {
    pub fn parse(s: &str) -> CpmResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "pool" | "embed-pool" => Ok(Self::Pool),
            "http" | "openai" => Ok(Self::OpenAi),
            other => Err(CpmError::invalid_config(format!(
                "unsupported embed mode: {other}"
            ))),
        }
    }
}

fn blocking_client(timeout_s: f64) -> CpmResult<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_s.max(1.0)))
        .build()
        .map_err(|e| CpmError::invalid_config(format!("http client: {e}")))
}

fn transport_error(e: reqwest::Error) -> CpmError {
    if e.is_timeout() {
        CpmError::timeout(format!("embed request timed out: {e}"))
    } else {
        CpmError::embed_unreachable(format!("embed transport error: {e}"))
    }
}

/// Client for the internal pool `/embed` endpoint.
pub struct PoolClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct PoolEmbedBody {
    vectors: Vec<Vec<f32>>,
}

impl PoolClient {
    pub fn new(base_url: &str, timeout_s: f64) -> CpmResult<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: blocking_client(timeout_s)?,
        })
    }

    pub fn health(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub fn embed(&self, model: &str, texts: &[String], options: &EmbedRequestOptions) -> CpmResult<Matrix> {
        let payload = json!({
            "model": model,
            "texts": texts,
            "options": options,
        });
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&payload)
            .send()
            .map_err(transport_error)?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CpmError::rate_limited(format!("pool rate limited: {status}")));
        }
        if status.is_client_error() {
            let body = response.text().unwrap_or_default();
            return Err(classify_client_error(status.as_u16(), &body));
        }
        if status.is_server_error() {
            return Err(CpmError::upstream(format!("pool upstream error: {status}")));
        }
        let body: PoolEmbedBody = response
            .json()
            .map_err(|e| CpmError::upstream(format!("pool response body: {e}")))?;
        Matrix::from_rows(&body.vectors)
    }
}

/// Classify a 4xx body. Validation errors are terminal, except the specific
/// "too many input items" signal, which drives batch shrink.
fn classify_client_error(status: u16, body: &str) -> CpmError {
    let lower = body.to_lowercase();
    if lower.contains("too many input items") {
        return CpmError::rate_limited(format!("too many input items (status={status})"));
    }
    if lower.contains("invalid_input") {
        return CpmError::invalid_spec(format!("invalid input (status={status}): {body}"));
    }
    CpmError::invalid_spec(format!("bad request (status={status}): {body}"))
}

/// Client for OpenAI-shaped `/v1/embeddings` endpoints.
pub struct OpenAiEmbeddingsClient {
    endpoint: String,
    client: reqwest::blocking::Client,
    max_retries: u32,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDataEntry {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiBody {
    data: Vec<OpenAiDataEntry>,
}

impl OpenAiEmbeddingsClient {
    pub fn new(base_url: &str, timeout_s: f64, max_retries: u32, api_key: Option<String>) -> CpmResult<Self> {
        let root = base_url.trim_end_matches('/');
        let endpoint = if root.ends_with("/v1/embeddings") {
            root.to_string()
        } else {
            format!("{root}/v1/embeddings")
        };
        Ok(Self {
            endpoint,
            client: blocking_client(timeout_s)?,
            max_retries: max_retries.max(1),
            api_key,
        })
    }

    pub fn health(&self) -> bool {
        // OPTIONS probe; anything below 500 counts as reachable.
        self.client
            .request(reqwest::Method::OPTIONS, &self.endpoint)
            .timeout(Duration::from_secs(2))
            .send()
            .map(|r| r.status().as_u16() < 500)
            .unwrap_or(false)
    }

    /// One embeddings call with retry/backoff. Vectors come back sorted by
    /// index; indices must be contiguous from zero.
    pub fn embed(&self, model: &str, texts: &[String], normalize: bool) -> CpmResult<Matrix> {
        let payload = json!({"input": texts, "model": model});
        let mut last_error: Option<CpmError> = None;

        for attempt in 1..=self.max_retries {
            let mut request = self.client.post(&self.endpoint).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let outcome = match request.send() {
                Ok(response) => self.handle_response(response),
                Err(e) => Err(transport_error(e)),
            };
            match outcome {
                Ok(mut matrix) => {
                    if matrix.nrows() != texts.len() {
                        return Err(CpmError::upstream(format!(
                            "embeddings response has {} rows for {} inputs",
                            matrix.nrows(),
                            texts.len()
                        )));
                    }
                    if normalize {
                        matrix.l2_normalize();
                    }
                    return Ok(matrix);
                }
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    let delay = retry_delay(&e, attempt);
                    debug!(attempt, delay_s = delay, error = %e, "embeddings retry");
                    std::thread::sleep(Duration::from_secs_f64(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| CpmError::upstream("failed to obtain embeddings after retries")))
    }

    fn handle_response(&self, response: reqwest::blocking::Response) -> CpmResult<Matrix> {
        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok());
            let mut err = CpmError::rate_limited(format!("rate limited (status={status})"));
            if let Some(seconds) = retry_after {
                err.message = format!("{} retry-after={seconds}", err.message);
            }
            return Err(err);
        }
        if (400..500).contains(&status) {
            let body = response.text().unwrap_or_default();
            warn!(status, body = %truncate(&body, 200), "embeddings bad request");
            return Err(classify_client_error(status, &body));
        }
        if status >= 500 {
            return Err(CpmError::upstream(format!("upstream error status={status}")));
        }
        let body: OpenAiBody = response
            .json()
            .map_err(|e| CpmError::upstream(format!("embeddings response body: {e}")))?;
        parse_openai_vectors(body)
    }
}

fn parse_openai_vectors(body: OpenAiBody) -> CpmResult<Matrix> {
    if body.data.is_empty() {
        return Err(CpmError::upstream("response.data cannot be empty"));
    }
    let mut entries = body.data;
    entries.sort_by_key(|e| e.index);
    for (expected, entry) in entries.iter().enumerate() {
        if entry.index != expected {
            return Err(CpmError::upstream(
                "response.data indexes must be contiguous and start from 0",
            ));
        }
    }
    let rows: Vec<Vec<f32>> = entries.into_iter().map(|e| e.embedding).collect();
    Matrix::from_rows(&rows)
}

/// Delay for a retriable error: `Retry-After` when present, otherwise capped
/// exponential backoff.
fn retry_delay(error: &CpmError, attempt: u32) -> f64 {
    if error.kind == ErrorKind::RateLimited {
        if let Some(pos) = error.message.find("retry-after=") {
            if let Ok(seconds) = error.message[pos + "retry-after=".len()..]
                .trim()
                .parse::<f64>()
            {
                return seconds.max(0.0);
            }
        }
    }
    (BACKOFF_BASE_S * f64::from(attempt)).min(BACKOFF_CAP_S)
}

/// Uniform embedder over either wire shape, with batching + adaptive shrink.
pub struct EmbeddingClient {
    base_url: String,
    mode: EmbedMode,
    timeout_s: f64,
    max_retries: u32,
    /// Cap on batch rows; `None` sends everything at once (until shrink).
    pub input_size: Option<usize>,
    api_key: Option<String>,
}

impl EmbeddingClient {
    pub fn new(base_url: &str, mode: EmbedMode) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            mode,
            timeout_s: 10.0,
            max_retries: 2,
            input_size: None,
            api_key: None,
        }
    }

    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_input_size(mut self, input_size: usize) -> Self {
        self.input_size = Some(input_size);
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn should_shrink(error: &CpmError) -> bool {
        matches!(error.kind, ErrorKind::RateLimited | ErrorKind::Timeout)
            || error.message.contains("too many input items")
    }

    fn embed_batch(&self, texts: &[String], options: &EmbedOptions) -> CpmResult<Matrix> {
        match self.mode {
            EmbedMode::Pool => {
                let client = PoolClient::new(&self.base_url, self.timeout_s)?;
                let request_options = EmbedRequestOptions {
                    max_seq_length: Some(options.max_seq_length),
                    normalize: Some(options.normalize),
                    dtype: Some(options.dtype.as_str().to_string()),
                    show_progress: Some(options.show_progress),
                };
                client.embed(&options.model, texts, &request_options)
            }
            EmbedMode::OpenAi => {
                let client = OpenAiEmbeddingsClient::new(
                    &self.base_url,
                    self.timeout_s,
                    self.max_retries,
                    self.api_key.clone(),
                )?;
                client.embed(&options.model, texts, options.normalize)
            }
        }
    }
}

impl Embedder for EmbeddingClient {
    fn health(&self) -> bool {
        match self.mode {
            EmbedMode::Pool => PoolClient::new(&self.base_url, self.timeout_s)
                .map(|c| c.health())
                .unwrap_or(false),
            EmbedMode::OpenAi => OpenAiEmbeddingsClient::new(
                &self.base_url,
                self.timeout_s,
                self.max_retries,
                self.api_key.clone(),
            )
            .map(|c| c.health())
            .unwrap_or(false),
        }
    }

    fn embed_texts(&self, texts: &[String], options: &EmbedOptions) -> CpmResult<Matrix> {
        if texts.is_empty() {
            return Ok(Matrix::new(0));
        }
        let mut batch_size = match self.input_size {
            Some(size) if size > 0 => size.min(texts.len()),
            _ => texts.len(),
        };

        loop {
            let mut rows: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
            let mut failed: Option<CpmError> = None;
            for batch in texts.chunks(batch_size) {
                match self.embed_batch(batch, options) {
                    Ok(matrix) => rows.extend(matrix.rows().map(|r| r.to_vec())),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            match failed {
                None => {
                    let matrix = Matrix::from_rows(&rows)?;
                    if matrix.nrows() != texts.len() {
                        return Err(CpmError::upstream(format!(
                            "embedder produced {} rows for {} texts",
                            matrix.nrows(),
                            texts.len()
                        )));
                    }
                    return Ok(matrix);
                }
                Some(e) if batch_size > 1 && Self::should_shrink(&e) => {
                    batch_size = (batch_size / 2).max(1);
                    warn!(new_batch_size = batch_size, error = %e, "shrinking embed batch");
                }
                Some(e) => return Err(e),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    let compact: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    compact.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(EmbedMode::parse("http").unwrap(), EmbedMode::OpenAi);
        assert_eq!(EmbedMode::parse("pool").unwrap(), EmbedMode::Pool);
        assert!(EmbedMode::parse("grpc").is_err());
    }

    #[test]
    fn openai_vectors_must_be_contiguous() {
        let body = OpenAiBody {
            data: vec![
                OpenAiDataEntry { index: 1, embedding: vec![1.0] },
                OpenAiDataEntry { index: 0, embedding: vec![2.0] },
            ],
        };
        let matrix = parse_openai_vectors(body).unwrap();
        assert_eq!(matrix.row(0), &[2.0]);
        assert_eq!(matrix.row(1), &[1.0]);

        let gap = OpenAiBody {
            data: vec![
                OpenAiDataEntry { index: 0, embedding: vec![1.0] },
                OpenAiDataEntry { index: 2, embedding: vec![2.0] },
            ],
        };
        assert!(parse_openai_vectors(gap).is_err());
    }

    #[test]
    fn shrink_signals() {
        assert!(EmbeddingClient::should_shrink(&CpmError::rate_limited("x")));
        assert!(EmbeddingClient::should_shrink(&CpmError::timeout("x")));
        assert!(EmbeddingClient::should_shrink(&CpmError::invalid_spec(
            "too many input items"
        )));
        assert!(!EmbeddingClient::should_shrink(&CpmError::invalid_spec(
            "bad dtype"
        )));
    }

    #[test]
    fn retry_delay_prefers_retry_after() {
        let mut e = CpmError::rate_limited("rate limited (status=429)");
        e.message = format!("{} retry-after=3.5", e.message);
        assert_eq!(retry_delay(&e, 1), 3.5);

        let plain = CpmError::timeout("t");
        assert!((retry_delay(&plain, 1) - 0.1).abs() < 1e-9);
        assert!((retry_delay(&plain, 50) - 1.0).abs() < 1e-9);
    }

    /// Stub embedder used to validate the adaptive shrink loop without any
    /// network: fails whole batches above a size cap.
    struct ShrinkingStub {
        cap: usize,
        calls: std::sync::Mutex<Vec<usize>>,
    }

    impl ShrinkingStub {
        fn embed_all(&self, texts: &[String]) -> CpmResult<Matrix> {
            let mut batch_size = texts.len();
            loop {
                let mut rows = Vec::new();
                let mut failed = None;
                for batch in texts.chunks(batch_size) {
                    self.calls.lock().unwrap().push(batch.len());
                    if batch.len() > self.cap {
                        failed = Some(CpmError::invalid_spec("too many input items"));
                        break;
                    }
                    for _ in batch {
                        rows.push(vec![1.0, 0.0]);
                    }
                }
                match failed {
                    None => return Matrix::from_rows(&rows),
                    Some(e) if batch_size > 1 && EmbeddingClient::should_shrink(&e) => {
                        batch_size = (batch_size / 2).max(1);
                    }
                    Some(e) => return Err(e),
                }
            }
        }
    }

    #[test]
    fn adaptive_shrink_reaches_batches_of_two() {
        let stub = ShrinkingStub {
            cap: 2,
            calls: std::sync::Mutex::new(Vec::new()),
        };
        let texts: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
        let matrix = stub.embed_all(&texts).unwrap();
        assert_eq!(matrix.nrows(), 5);

        let calls = stub.calls.lock().unwrap();
        let small_batches = calls.iter().filter(|&&size| size <= 2).count();
        assert!(small_batches >= 2, "calls: {calls:?}");
    }
}
