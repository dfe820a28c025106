//! Per-model runtime: bounded work queue, replica set, autoscaler.
//!
//! Each runtime owns one bounded queue and a set of replicas, each running a
//! driver on blocking worker threads. A ~500 ms scaler loop grows the set
//! (queue non-empty, nothing idle, below `scaling.max`) and retires idle
//! replicas past `idle_ttl_s` down to `scaling.min`. A global semaphore caps
//! concurrent driver calls across all models.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::matrix::Matrix;

use crate::drivers::{build_driver, EmbedDriver};
use crate::types::{EmbedRequestOptions, ModelSpec};

const SCALER_TICK: Duration = Duration::from_millis(500);
const QUEUE_POLL: Duration = Duration::from_millis(500);

const STATE_IDLE: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_STOPPING: u8 = 2;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Successful embedding outcome.
#[derive(Debug)]
pub struct EmbedOutcome {
    pub vectors: Matrix,
    pub dim: usize,
    pub replica_id: String,
}

struct WorkItem {
    texts: Vec<String>,
    options: EmbedRequestOptions,
    reply: oneshot::Sender<CpmResult<EmbedOutcome>>,
    created_ms: i64,
}

struct ReplicaHandle {
    id: String,
    state: Arc<AtomicU8>,
    last_idle_ms: Arc<AtomicI64>,
    stop_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// One model's queue + replica pool.
pub struct ModelRuntime {
    spec: RwLock<ModelSpec>,
    queue_tx: mpsc::Sender<WorkItem>,
    queue_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    queue_len: Arc<AtomicUsize>,
    replicas: Mutex<Vec<ReplicaHandle>>,
    replica_counter: AtomicU64,
    running: Arc<AtomicBool>,
    scaler: Mutex<Option<JoinHandle<()>>>,
    global_sem: Arc<Semaphore>,
}

impl ModelRuntime {
    pub fn new(spec: ModelSpec, global_sem: Arc<Semaphore>) -> Arc<Self> {
        let capacity = spec.queue.max_size.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            spec: RwLock::new(spec),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            queue_len: Arc::new(AtomicUsize::new(0)),
            replicas: Mutex::new(Vec::new()),
            replica_counter: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            scaler: Mutex::new(None),
            global_sem,
        })
    }

    pub fn model_name(&self) -> String {
        self.spec.read().expect("spec lock").model.clone()
    }

    /// Refresh the spec on hot-reload; queue capacity changes require a
    /// restart and are ignored here.
    pub fn update_spec(&self, spec: ModelSpec) {
        *self.spec.write().expect("spec lock") = spec;
    }

    pub fn status(&self) -> Value {
        let spec = self.spec.read().expect("spec lock").clone();
        let (total, idle, busy) = {
            let replicas = self.replicas.try_lock();
            match replicas {
                Ok(replicas) => {
                    let idle = replicas
                        .iter()
                        .filter(|r| r.state.load(Ordering::SeqCst) == STATE_IDLE)
                        .count();
                    let busy = replicas
                        .iter()
                        .filter(|r| r.state.load(Ordering::SeqCst) == STATE_BUSY)
                        .count();
                    (replicas.len(), idle, busy)
                }
                Err(_) => (0, 0, 0),
            }
        };
        json!({
            "model": spec.model,
            "alias": spec.alias,
            "enabled": spec.enabled,
            "driver_type": spec.driver.r#type,
            "replicas": total,
            "replicas_idle": idle,
            "replicas_busy": busy,
            "queue_len": self.queue_len.load(Ordering::SeqCst),
            "scaling": {
                "min": spec.scaling.min,
                "max": spec.scaling.max,
                "idle_ttl_s": spec.scaling.idle_ttl_s,
            },
        })
    }

    /// Start `scaling.min` replicas and the scaler loop.
    pub async fn start(self: &Arc<Self>) -> CpmResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let min = self.spec.read().expect("spec lock").scaling.min;
        for _ in 0..min {
            self.add_replica().await?;
        }
        let runtime = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while runtime.running.load(Ordering::SeqCst) {
                tokio::time::sleep(SCALER_TICK).await;
                runtime.apply_scaling().await;
            }
        });
        *self.scaler.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the scaler and all replicas; fail everything still queued.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.scaler.lock().await.take() {
            handle.abort();
        }
        {
            let mut replicas = self.replicas.lock().await;
            for replica in replicas.iter() {
                replica.state.store(STATE_STOPPING, Ordering::SeqCst);
                replica.stop_flag.store(true, Ordering::SeqCst);
            }
            replicas.clear();
        }
        // Drain and fail whatever is still queued. Replica loops notice the
        // running flag on their next poll tick.
        let mut queue = self.queue_rx.lock().await;
        while let Ok(item) = queue.try_recv() {
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
            let _ = item
                .reply
                .send(Err(CpmError::cancelled("model runtime stopped")));
        }
    }

    /// Queue one embedding request and wait for its result.
    pub async fn enqueue(
        &self,
        texts: Vec<String>,
        options: EmbedRequestOptions,
    ) -> CpmResult<EmbedOutcome> {
        {
            let spec = self.spec.read().expect("spec lock");
            if !spec.enabled {
                return Err(CpmError::model_disabled(format!(
                    "model disabled: {}",
                    spec.model
                )));
            }
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = WorkItem {
            texts,
            options,
            reply: reply_tx,
            created_ms: now_ms(),
        };
        match self.queue_tx.try_send(item) {
            Ok(()) => {
                self.queue_len.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(CpmError::queue_full(format!(
                    "queue full for model: {}",
                    self.model_name()
                )));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(CpmError::cancelled("model runtime stopped"));
            }
        }
        self.maybe_scale_up().await;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(CpmError::cancelled("model runtime stopped")))
    }

    async fn maybe_scale_up(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let max = self.spec.read().expect("spec lock").scaling.max as usize;
        let needs_replica = {
            let replicas = self.replicas.lock().await;
            replicas.len() < max
                && !replicas
                    .iter()
                    .any(|r| r.state.load(Ordering::SeqCst) == STATE_IDLE)
        };
        if needs_replica && self.queue_len.load(Ordering::SeqCst) > 0 {
            if let Err(e) = self.add_replica().await {
                warn!(error = %e, "replica scale-up failed");
            }
        }
    }

    async fn apply_scaling(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let (min, ttl_ms) = {
            let spec = self.spec.read().expect("spec lock");
            (
                spec.scaling.min as usize,
                (spec.scaling.idle_ttl_s as i64) * 1000,
            )
        };

        // Grow back to the floor after failures or retirements.
        loop {
            let count = self.replicas.lock().await.len();
            if count >= min {
                break;
            }
            if let Err(e) = self.add_replica().await {
                warn!(error = %e, "replica floor restore failed");
                break;
            }
        }

        let now = now_ms();
        let mut replicas = self.replicas.lock().await;
        if replicas.len() <= min {
            return;
        }
        let mut keep: Vec<ReplicaHandle> = Vec::with_capacity(replicas.len());
        let mut removable = replicas.len() - min;
        for replica in replicas.drain(..) {
            let idle = replica.state.load(Ordering::SeqCst) == STATE_IDLE;
            let idle_since = replica.last_idle_ms.load(Ordering::SeqCst);
            if removable > 0 && idle && now - idle_since >= ttl_ms {
                debug!(replica = %replica.id, "retiring idle replica");
                replica.state.store(STATE_STOPPING, Ordering::SeqCst);
                replica.stop_flag.store(true, Ordering::SeqCst);
                removable -= 1;
            } else {
                keep.push(replica);
            }
        }
        *replicas = keep;
    }

    async fn add_replica(&self) -> CpmResult<()> {
        let spec = self.spec.read().expect("spec lock").clone();
        let ordinal = self.replica_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let replica_id = format!("{}#{ordinal}", spec.model);

        // Build and warm the driver off the event loop.
        let driver_spec = spec.driver.clone();
        let model = spec.model.clone();
        let mut driver = tokio::task::spawn_blocking(move || -> CpmResult<Box<dyn EmbedDriver>> {
            let mut driver = build_driver(&model, &driver_spec)?;
            driver.warmup()?;
            Ok(driver)
        })
        .await
        .map_err(|e| CpmError::worker_crashed(format!("driver warmup task: {e}")))??;

        let state = Arc::new(AtomicU8::new(STATE_IDLE));
        let last_idle_ms = Arc::new(AtomicI64::new(now_ms()));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let loop_state = Arc::clone(&state);
        let loop_idle = Arc::clone(&last_idle_ms);
        let loop_stop = Arc::clone(&stop_flag);
        let running = Arc::clone(&self.running);
        let queue_rx = Arc::clone(&self.queue_rx);
        let queue_len = Arc::clone(&self.queue_len);
        let global_sem = Arc::clone(&self.global_sem);
        let loop_replica_id = replica_id.clone();

        let task = tokio::spawn(async move {
            loop {
                if !running.load(Ordering::SeqCst) || loop_stop.load(Ordering::SeqCst) {
                    break;
                }
                let item = {
                    let mut rx = queue_rx.lock().await;
                    match tokio::time::timeout(QUEUE_POLL, rx.recv()).await {
                        Err(_) => continue,
                        Ok(None) => break,
                        Ok(Some(item)) => item,
                    }
                };
                queue_len.fetch_sub(1, Ordering::SeqCst);
                if !running.load(Ordering::SeqCst) {
                    let _ = item
                        .reply
                        .send(Err(CpmError::cancelled("model runtime stopped")));
                    break;
                }

                loop_state.store(STATE_BUSY, Ordering::SeqCst);
                let permit = match global_sem.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = item
                            .reply
                            .send(Err(CpmError::cancelled("model runtime stopped")));
                        break;
                    }
                };

                let texts = item.texts;
                let options = item.options;
                let result = tokio::task::spawn_blocking(move || {
                    let result = driver.embed(&texts, &options);
                    (driver, result)
                })
                .await;
                drop(permit);

                match result {
                    Ok((returned_driver, embed_result)) => {
                        driver = returned_driver;
                        let outcome = embed_result.map(|vectors| EmbedOutcome {
                            dim: vectors.dim(),
                            vectors,
                            replica_id: loop_replica_id.clone(),
                        });
                        let _ = item.reply.send(outcome);
                    }
                    Err(e) => {
                        let _ = item.reply.send(Err(CpmError::worker_crashed(format!(
                            "embed task panicked: {e}"
                        ))));
                        break;
                    }
                }
                debug!(replica = %loop_replica_id, waited_ms = now_ms() - item.created_ms, "work item served");
                loop_idle.store(now_ms(), Ordering::SeqCst);
                loop_state.store(STATE_IDLE, Ordering::SeqCst);
            }
            loop_state.store(STATE_STOPPING, Ordering::SeqCst);
        });

        self.replicas.lock().await.push(ReplicaHandle {
            id: replica_id,
            state,
            last_idle_ms,
            stop_flag,
            task,
        });
        Ok(())
    }
}

impl Drop for ModelRuntime {
    fn drop(&mut self) {
        if let Ok(replicas) = self.replicas.try_lock() {
            for replica in replicas.iter() {
                replica.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DriverSpec, DriverType};

    fn local_spec(model: &str) -> ModelSpec {
        let mut spec = ModelSpec::new(model);
        spec.driver = DriverSpec {
            r#type: DriverType::LocalSt,
            config: std::collections::BTreeMap::from([(
                "dim".to_string(),
                serde_json::json!(16),
            )]),
        };
        spec
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueue_and_serve() {
        let runtime = ModelRuntime::new(local_spec("m"), Arc::new(Semaphore::new(8)));
        runtime.start().await.unwrap();

        let outcome = runtime
            .enqueue(vec!["hello world".to_string()], EmbedRequestOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.dim, 16);
        assert_eq!(outcome.vectors.nrows(), 1);
        assert!(outcome.replica_id.starts_with("m#"));
        runtime.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_model_rejects() {
        let mut spec = local_spec("m");
        spec.enabled = false;
        let runtime = ModelRuntime::new(spec, Arc::new(Semaphore::new(8)));
        runtime.start().await.unwrap();
        let err = runtime
            .enqueue(vec!["x".to_string()], EmbedRequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::ModelDisabled);
        runtime.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_full_fails_fast() {
        let mut spec = local_spec("m");
        spec.queue.max_size = 1;
        spec.scaling.min = 0;
        spec.scaling.max = 0;
        let runtime = ModelRuntime::new(spec, Arc::new(Semaphore::new(1)));
        runtime.start().await.unwrap();

        // No replicas exist, so the first item parks in the queue.
        let rt2 = Arc::clone(&runtime);
        let first = tokio::spawn(async move {
            rt2.enqueue(vec!["a".to_string()], EmbedRequestOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = runtime
            .enqueue(vec!["b".to_string()], EmbedRequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::QueueFull);

        runtime.stop().await;
        let first = first.await.unwrap();
        assert!(first.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cancels_queued_items() {
        let mut spec = local_spec("m");
        spec.scaling.min = 0;
        spec.scaling.max = 0;
        let runtime = ModelRuntime::new(spec, Arc::new(Semaphore::new(1)));
        runtime.start().await.unwrap();

        let rt2 = Arc::clone(&runtime);
        let pending = tokio::spawn(async move {
            rt2.enqueue(vec!["queued".to_string()], EmbedRequestOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("future unblocked")
            .unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scales_up_under_load() {
        let mut spec = local_spec("m");
        spec.scaling.min = 1;
        spec.scaling.max = 3;
        let runtime = ModelRuntime::new(spec, Arc::new(Semaphore::new(8)));
        runtime.start().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..6 {
            let rt = Arc::clone(&runtime);
            tasks.push(tokio::spawn(async move {
                rt.enqueue(vec![format!("text {i}")], EmbedRequestOptions::default())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let status = runtime.status();
        assert!(status["replicas"].as_u64().unwrap() >= 1);
        runtime.stop().await;
    }
}
