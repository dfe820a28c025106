//! The embedding pool HTTP surface.
//!
//! Routes: `GET /health`, `GET /status`, `POST /reload`, `POST /embed`,
//! `POST /models/register`, `POST /models/enable`, `POST /models/alias`,
//! `DELETE /models/{name}`.
//!
//! `/embed` consults the persistent sha256 cache per text, enqueues only the
//! misses, merges results back into request order and back-fills the cache.
//! Hot reload re-reads `pool.yml`: removed models stop and their cache rows
//! are purged; unchanged models keep their runtime but refresh their spec.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{error, info};

use cpm_core::errors::{CpmError, ErrorKind};
use cpm_store::EmbedCache;

use crate::runtime::ModelRuntime;
use crate::types::{
    load_pool, save_pool, DriverSpec, DriverType, EmbedRequestOptions, ModelSpec, PoolConfig,
    PoolFile, QueueSpec, ScalingSpec,
};

/// Shared server state.
pub struct PoolState {
    pool_path: PathBuf,
    pool: RwLock<PoolFile>,
    runtimes: Mutex<BTreeMap<String, Arc<ModelRuntime>>>,
    global_sem: Arc<Semaphore>,
    cache: Arc<EmbedCache>,
    request_timeout: std::time::Duration,
    booted: AtomicBool,
    last_reload: RwLock<Option<String>>,
}

impl PoolState {
    pub fn new(config: &PoolConfig) -> Result<Arc<Self>, CpmError> {
        let cache = EmbedCache::open(&config.cache_dir)?;
        Ok(Arc::new(Self {
            pool_path: config.pool_yml.clone(),
            pool: RwLock::new(PoolFile::default()),
            runtimes: Mutex::new(BTreeMap::new()),
            global_sem: Arc::new(Semaphore::new(config.max_inflight_global.max(1))),
            cache: Arc::new(cache),
            request_timeout: std::time::Duration::from_secs(config.request_timeout_s.max(1)),
            booted: AtomicBool::new(false),
            last_reload: RwLock::new(None),
        }))
    }

    async fn apply_pool(&self, pool: PoolFile) -> Result<(), CpmError> {
        pool.check_alias_conflicts()?;

        let mut runtimes = self.runtimes.lock().await;
        let new_models: Vec<String> = pool.models.iter().map(|m| m.model.clone()).collect();

        let stale: Vec<String> = runtimes
            .keys()
            .filter(|name| !new_models.contains(name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(runtime) = runtimes.remove(&name) {
                info!(model = %name, "stopping removed model runtime");
                runtime.stop().await;
            }
        }

        for spec in &pool.models {
            match runtimes.get(&spec.model) {
                Some(runtime) => runtime.update_spec(spec.clone()),
                None => {
                    let runtime = ModelRuntime::new(spec.clone(), Arc::clone(&self.global_sem));
                    runtime.start().await?;
                    runtimes.insert(spec.model.clone(), runtime);
                }
            }
        }
        drop(runtimes);

        *self.pool.write().await = pool;
        self.booted.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Re-read `pool.yml` and reconcile runtimes + cache rows.
    pub async fn reload(&self, reason: &str) -> Result<(), CpmError> {
        let pool = load_pool(&self.pool_path)?;
        let allowed: Vec<String> = pool.models.iter().map(|m| m.model.clone()).collect();
        self.apply_pool(pool).await?;

        let cache = Arc::clone(&self.cache);
        let pruned = tokio::task::spawn_blocking(move || cache.prune_models(&allowed))
            .await
            .map_err(|e| CpmError::invariant(format!("cache prune task: {e}")))??;
        if pruned > 0 {
            info!(removed_rows = pruned, "cache pruned after reload");
        }
        *self.last_reload.write().await = Some(reason.to_string());
        Ok(())
    }

    /// Stop every runtime (server shutdown).
    pub async fn shutdown(&self) {
        let mut runtimes = self.runtimes.lock().await;
        for (_, runtime) in std::mem::take(&mut *runtimes) {
            runtime.stop().await;
        }
    }
}

/// Structured API error with its HTTP status.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<CpmError> for ApiError {
    fn from(e: CpmError) -> Self {
        match e.kind {
            ErrorKind::InvalidConfig | ErrorKind::InvalidSpec | ErrorKind::MissingRequired => {
                Self::bad_request(e.to_string())
            }
            ErrorKind::ModelDisabled | ErrorKind::QueueFull => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                detail: e.to_string(),
            },
            _ => Self::internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub model: String,
    pub texts: Vec<String>,
    #[serde(default)]
    pub options: EmbedRequestOptions,
}

#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub model: String,
    pub dim: usize,
    pub vectors: Vec<Vec<f32>>,
    pub meta: Value,
}

#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "manual".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub model: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub driver_type: Option<DriverType>,
    #[serde(default)]
    pub driver_config: BTreeMap<String, Value>,
    #[serde(default = "default_one")]
    pub min: u32,
    #[serde(default = "default_one")]
    pub max: u32,
    #[serde(default = "default_ttl")]
    pub idle_ttl_s: u64,
    #[serde(default = "default_queue")]
    pub queue_max_size: usize,
    #[serde(default = "default_one")]
    pub max_inflight_per_replica: u32,
}

fn default_true() -> bool {
    true
}
fn default_one() -> u32 {
    1
}
fn default_ttl() -> u64 {
    30
}
fn default_queue() -> usize {
    1000
}

#[derive(Debug, Deserialize)]
pub struct EnableRequest {
    pub model: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AliasRequest {
    pub model: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Build the axum application.
pub fn build_app(state: Arc<PoolState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/reload", post(reload))
        .route("/embed", post(embed))
        .route("/models/register", post(models_register))
        .route("/models/enable", post(models_enable))
        .route("/models/alias", post(models_alias))
        .route("/models/{model_name}", delete(models_delete))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until ctrl-c.
pub async fn serve(config: PoolConfig) -> Result<(), CpmError> {
    let state = PoolState::new(&config)?;
    state.reload("startup").await?;

    let app = build_app(Arc::clone(&state));
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CpmError::io(format!("bind {addr}: {e}")))?;
    info!(addr = %addr, "embedding pool listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_state.shutdown().await;
        })
        .await
        .map_err(|e| CpmError::io(format!("server: {e}")))?;
    Ok(())
}

async fn health(State(state): State<Arc<PoolState>>) -> Json<Value> {
    let pool = state.pool.read().await;
    Json(json!({
        "ok": true,
        "booted": state.booted.load(Ordering::SeqCst),
        "models": pool.models.len(),
    }))
}

async fn status(State(state): State<Arc<PoolState>>) -> Json<Value> {
    let pool = state.pool.read().await;
    let runtimes = state.runtimes.lock().await;
    let mut models = Vec::new();
    for spec in &pool.models {
        match runtimes.get(&spec.model) {
            Some(runtime) => models.push(runtime.status()),
            None => models.push(json!({
                "model": spec.model,
                "enabled": spec.enabled,
                "replicas": 0,
            })),
        }
    }
    Json(json!({
        "ok": true,
        "last_reload": *state.last_reload.read().await,
        "models": models,
    }))
}

async fn reload(
    State(state): State<Arc<PoolState>>,
    Json(request): Json<ReloadRequest>,
) -> Result<Json<Value>, ApiError> {
    state.reload(&request.reason).await?;
    Ok(Json(json!({"ok": true})))
}

async fn embed(
    State(state): State<Arc<PoolState>>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, ApiError> {
    if request.texts.is_empty() {
        return Err(ApiError::bad_request("texts must be non-empty"));
    }

    let model_name = {
        let pool = state.pool.read().await;
        match pool.resolve_model(&request.model) {
            Some(spec) => spec.model.clone(),
            None => {
                return Err(ApiError::not_found(format!(
                    "unknown model/alias: {}",
                    request.model
                )))
            }
        }
    };
    let runtime = {
        let runtimes = state.runtimes.lock().await;
        match runtimes.get(&model_name) {
            Some(runtime) => Arc::clone(runtime),
            None => {
                return Err(ApiError::internal(format!(
                    "runtime missing for model: {model_name}"
                )))
            }
        }
    };

    // 1) cache lookup
    let cache = Arc::clone(&state.cache);
    let lookup_model = model_name.clone();
    let lookup_texts = request.texts.clone();
    let (hashes, found) =
        tokio::task::spawn_blocking(move || cache.get_many(&lookup_model, &lookup_texts))
            .await
            .map_err(|e| ApiError::internal(format!("cache task: {e}")))?
            .unwrap_or_else(|e| {
                error!(error = %e, "cache lookup failed; treating all texts as misses");
                (Vec::new(), std::collections::HashMap::new())
            });

    let missing_idx: Vec<usize> = (0..request.texts.len())
        .filter(|i| !found.contains_key(i))
        .collect();

    // 2) all hits: answer straight from the cache
    if missing_idx.is_empty() {
        let dim = found.get(&0).map(|v| v.len()).unwrap_or(0);
        let mut vectors = Vec::with_capacity(request.texts.len());
        for i in 0..request.texts.len() {
            vectors.push(found[&i].clone());
        }
        return Ok(Json(EmbedResponse {
            model: model_name,
            dim,
            vectors,
            meta: json!({"cache": {"hits": request.texts.len(), "misses": 0}}),
        }));
    }

    // 3) embed the misses; the reply never outlives the configured deadline
    let missing_texts: Vec<String> = missing_idx.iter().map(|&i| request.texts[i].clone()).collect();
    let outcome = tokio::time::timeout(
        state.request_timeout,
        runtime.enqueue(missing_texts, request.options.clone()),
    )
    .await
    .map_err(|_| ApiError::internal("embed request timed out"))??;
    if outcome.vectors.nrows() != missing_idx.len() {
        return Err(ApiError::internal(format!(
            "driver returned {} rows for {} texts",
            outcome.vectors.nrows(),
            missing_idx.len()
        )));
    }
    let dim = outcome.dim;

    // 4) merge preserving original order
    let mut merged: Vec<Vec<f32>> = vec![Vec::new(); request.texts.len()];
    for (i, vector) in &found {
        merged[*i] = vector.clone();
    }
    for (j, &i) in missing_idx.iter().enumerate() {
        merged[i] = outcome.vectors.row(j).to_vec();
    }
    for (i, row) in merged.iter().enumerate() {
        if row.len() != dim {
            return Err(ApiError::internal(format!(
                "row {i} has width {} but expected {dim} (cache/driver dim drift)",
                row.len()
            )));
        }
    }

    // 5) back-fill the cache with the fresh rows
    if hashes.len() == request.texts.len() {
        let miss_hashes: Vec<String> = missing_idx.iter().map(|&i| hashes[i].clone()).collect();
        let cache = Arc::clone(&state.cache);
        let fresh = outcome.vectors.clone();
        let put_model = model_name.clone();
        let now = chrono::Utc::now().timestamp();
        let put_result =
            tokio::task::spawn_blocking(move || cache.put_many(&put_model, &miss_hashes, &fresh, now))
                .await;
        match put_result {
            Ok(Err(e)) => error!(error = %e, "cache back-fill failed"),
            Err(e) => error!(error = %e, "cache back-fill task failed"),
            Ok(Ok(_)) => {}
        }
    }

    let meta = json!({
        "replica_id": outcome.replica_id,
        "cache": {"hits": found.len(), "misses": missing_idx.len()},
    });
    Ok(Json(EmbedResponse {
        model: model_name,
        dim,
        vectors: merged,
        meta,
    }))
}

async fn models_register(
    State(state): State<Arc<PoolState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::bad_request("model must be non-empty"));
    }
    {
        let mut pool = state.pool.write().await;
        let driver = DriverSpec {
            r#type: request.driver_type.unwrap_or(DriverType::LocalSt),
            config: request.driver_config.clone(),
        };
        let scaling = ScalingSpec {
            min: request.min,
            max: request.max.max(request.min),
            idle_ttl_s: request.idle_ttl_s,
        };
        let queue = QueueSpec {
            max_size: request.queue_max_size,
            max_inflight_per_replica: request.max_inflight_per_replica,
        };
        match pool.models.iter_mut().find(|m| m.model == request.model) {
            Some(existing) => {
                existing.alias = request.alias.clone();
                existing.enabled = request.enabled;
                existing.driver = driver;
                existing.scaling = scaling;
                existing.queue = queue;
            }
            None => pool.models.push(ModelSpec {
                model: request.model.clone(),
                alias: request.alias.clone(),
                enabled: request.enabled,
                driver,
                scaling,
                queue,
            }),
        }
        save_pool(&state.pool_path, &pool)?;
    }
    state.reload("register").await?;
    Ok(Json(json!({"ok": true})))
}

async fn models_enable(
    State(state): State<Arc<PoolState>>,
    Json(request): Json<EnableRequest>,
) -> Result<Json<Value>, ApiError> {
    mutate_matching(&state, &request.model, |spec| spec.enabled = request.enabled).await?;
    state.reload("enable").await?;
    Ok(Json(json!({"ok": true})))
}

async fn models_alias(
    State(state): State<Arc<PoolState>>,
    Json(request): Json<AliasRequest>,
) -> Result<Json<Value>, ApiError> {
    let alias = request
        .alias
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from);
    mutate_matching(&state, &request.model, move |spec| spec.alias = alias.clone()).await?;
    state.reload("alias").await?;
    Ok(Json(json!({"ok": true})))
}

async fn models_delete(
    State(state): State<Arc<PoolState>>,
    AxumPath(model_name): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    {
        let mut pool = state.pool.write().await;
        let before = pool.models.len();
        pool.models
            .retain(|m| m.model != model_name && m.alias.as_deref() != Some(model_name.as_str()));
        if pool.models.len() == before {
            return Err(ApiError::not_found(format!(
                "unknown model/alias: {model_name}"
            )));
        }
        save_pool(&state.pool_path, &pool)?;
    }
    state.reload("delete").await?;
    Ok(Json(json!({"ok": true})))
}

async fn mutate_matching(
    state: &Arc<PoolState>,
    name_or_alias: &str,
    mutate: impl Fn(&mut ModelSpec),
) -> Result<(), ApiError> {
    let mut pool = state.pool.write().await;
    let mut found = false;
    for spec in pool.models.iter_mut() {
        if spec.model == name_or_alias || spec.alias.as_deref() == Some(name_or_alias) {
            mutate(spec);
            found = true;
        }
    }
    if !found {
        return Err(ApiError::not_found(format!(
            "unknown model/alias: {name_or_alias}"
        )));
    }
    save_pool(&state.pool_path, &pool)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DriverType;

    fn test_config(tmp: &std::path::Path) -> PoolConfig {
        PoolConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            pool_yml: tmp.join("pool.yml"),
            cache_dir: tmp.join("cache"),
            request_timeout_s: 10,
            max_inflight_global: 8,
        }
    }

    fn local_model(name: &str) -> ModelSpec {
        let mut spec = ModelSpec::new(name);
        spec.driver = DriverSpec {
            r#type: DriverType::LocalSt,
            config: BTreeMap::from([("dim".to_string(), json!(8))]),
        };
        spec
    }

    fn write_pool(path: &std::path::Path, models: Vec<ModelSpec>) {
        save_pool(path, &PoolFile { version: 1, models }).unwrap();
    }

    async fn call_embed(
        state: &Arc<PoolState>,
        model: &str,
        texts: &[&str],
    ) -> Result<EmbedResponse, ApiError> {
        embed(
            State(Arc::clone(state)),
            Json(EmbedRequest {
                model: model.to_string(),
                texts: texts.iter().map(|t| t.to_string()).collect(),
                options: EmbedRequestOptions::default(),
            }),
        )
        .await
        .map(|Json(body)| body)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn embed_then_cache_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        write_pool(&config.pool_yml, vec![local_model("m1")]);
        let state = PoolState::new(&config).unwrap();
        state.reload("startup").await.unwrap();

        let first = call_embed(&state, "m1", &["hello", "world"]).await.unwrap();
        assert_eq!(first.vectors.len(), 2);
        assert_eq!(first.meta["cache"]["misses"], 2);

        let second = call_embed(&state, "m1", &["hello", "world"]).await.unwrap();
        assert_eq!(second.meta["cache"]["hits"], 2);
        assert_eq!(second.vectors, first.vectors);
        state.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hot_reload_removes_model_and_prunes_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        write_pool(&config.pool_yml, vec![local_model("m1"), local_model("m2")]);
        let state = PoolState::new(&config).unwrap();
        state.reload("startup").await.unwrap();

        call_embed(&state, "m1", &["text"]).await.unwrap();
        assert_eq!(state.cache.count_model("m1").unwrap(), 1);

        // Remove m1 from pool.yml and reload.
        write_pool(&config.pool_yml, vec![local_model("m2")]);
        state.reload("test").await.unwrap();

        let err = call_embed(&state, "m1", &["text"]).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(state.cache.count_model("m1").unwrap(), 0);
        state.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn alias_resolves_and_empty_texts_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let mut model = local_model("m1");
        model.alias = Some("fast".to_string());
        write_pool(&config.pool_yml, vec![model]);
        let state = PoolState::new(&config).unwrap();
        state.reload("startup").await.unwrap();

        let ok = call_embed(&state, "fast", &["via alias"]).await.unwrap();
        assert_eq!(ok.model, "m1");

        let err = call_embed(&state, "m1", &[]).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        state.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn alias_conflict_fails_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let mut a = local_model("a");
        a.alias = Some("x".to_string());
        let mut b = local_model("b");
        b.alias = Some("x".to_string());
        write_pool(&config.pool_yml, vec![a, b]);
        let state = PoolState::new(&config).unwrap();
        assert!(state.reload("startup").await.is_err());
    }
}
