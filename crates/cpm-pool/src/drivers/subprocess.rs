//! Subprocess driver: a long-lived worker spoken to over stdin/stdout
//! JSON-lines.
//!
//! Protocol:
//! - handshake: the worker prints a line starting with `READY` before any
//!   request is sent (startup timeout applies)
//! - request:  `{"id": N, "texts": [...], "options": {...}}`
//! - response: `{"id": N, "ok": true, "vectors": [[...]], "dim": d}`
//!             `{"id": N, "ok": false, "error": "...", "trace": "..."}`
//! - shutdown: `{"op": "shutdown"}`
//!
//! Requests are strictly paired by monotonically increasing id. A dedicated
//! thread drains stderr into a bounded ring buffer continuously (model
//! runtimes are chatty and an undrained pipe deadlocks the worker); the tail
//! is appended to every error. Lifecycle:
//! spawn -> handshake -> serving -> draining -> exited.

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use cpm_core::errors::{CpmError, CpmResult};
use cpm_core::matrix::Matrix;

use crate::types::EmbedRequestOptions;

use super::EmbedDriver;

const STDERR_RING_LINES: usize = 2000;
const STDERR_TAIL_LINES: usize = 200;

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    vectors: Vec<Vec<f32>>,
    #[serde(default)]
    dim: usize,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    trace: Option<String>,
}

struct WorkerProcess {
    child: Child,
    stdin: std::process::ChildStdin,
    stdout_rx: Receiver<String>,
}

pub struct SubprocessDriver {
    model_name: String,
    cmd: Vec<String>,
    cwd: Option<String>,
    env: BTreeMap<String, String>,
    startup_timeout: Duration,
    request_timeout: Duration,
    process: Option<WorkerProcess>,
    next_id: i64,
    dim: usize,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
}

impl SubprocessDriver {
    pub fn new(
        model_name: &str,
        cmd: Vec<String>,
        cwd: Option<String>,
        env: BTreeMap<String, String>,
        startup_timeout_s: f64,
        timeout_s: f64,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            cmd,
            cwd,
            env,
            startup_timeout: Duration::from_secs_f64(startup_timeout_s.max(1.0)),
            request_timeout: Duration::from_secs_f64(timeout_s.max(1.0)),
            process: None,
            next_id: 0,
            dim: 0,
            stderr_ring: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_LINES))),
        }
    }

    fn stderr_tail(&self) -> String {
        let ring = self.stderr_ring.lock().expect("stderr ring");
        let skip = ring.len().saturating_sub(STDERR_TAIL_LINES);
        ring.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }

    fn error_with_tail(&self, message: impl Into<String>) -> CpmError {
        let tail = self.stderr_tail();
        let message = message.into();
        if tail.is_empty() {
            CpmError::worker_crashed(message)
        } else {
            CpmError::worker_crashed(format!("{message}. stderr (tail):\n{tail}"))
        }
    }

    fn worker_alive(process: &mut WorkerProcess) -> bool {
        matches!(process.child.try_wait(), Ok(None))
    }

    fn ensure_started(&mut self) -> CpmResult<()> {
        if let Some(process) = self.process.as_mut() {
            if Self::worker_alive(process) {
                return Ok(());
            }
            self.process = None;
        }

        let mut command = Command::new(&self.cmd[0]);
        command
            .args(&self.cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("EMBEDPOOL_MODEL", &self.model_name);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CpmError::worker_crashed(format!("worker spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CpmError::worker_crashed("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CpmError::worker_crashed("worker stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CpmError::worker_crashed("worker stderr unavailable"))?;

        // Continuous stderr drain into the bounded ring.
        let ring = Arc::clone(&self.stderr_ring);
        std::thread::Builder::new()
            .name("embedpool-worker-stderr".to_string())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if line.is_empty() {
                        continue;
                    }
                    let mut ring = ring.lock().expect("stderr ring");
                    if ring.len() >= STDERR_RING_LINES {
                        ring.pop_front();
                    }
                    ring.push_back(line);
                }
            })
            .map_err(|e| CpmError::worker_crashed(format!("stderr drain spawn: {e}")))?;

        // Dedicated stdout reader; request/response pairing happens via the
        // channel so timeouts never leave a blocked read behind.
        let (stdout_tx, stdout_rx) = std::sync::mpsc::channel::<String>();
        std::thread::Builder::new()
            .name("embedpool-worker-stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if stdout_tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| CpmError::worker_crashed(format!("stdout reader spawn: {e}")))?;

        let mut process = WorkerProcess {
            child,
            stdin,
            stdout_rx,
        };

        // Handshake: wait for a READY line.
        match process.stdout_rx.recv_timeout(self.startup_timeout) {
            Ok(line) if line.starts_with("READY") => {}
            Ok(line) => {
                let _ = process.child.kill();
                return Err(self.error_with_tail(format!("worker handshake failed: {line:?}")));
            }
            Err(_) => {
                let _ = process.child.kill();
                return Err(self.error_with_tail("worker startup timeout"));
            }
        }

        self.process = Some(process);
        Ok(())
    }
}

impl EmbedDriver for SubprocessDriver {
    fn warmup(&mut self) -> CpmResult<()> {
        self.ensure_started()
    }

    fn embed(&mut self, texts: &[String], options: &EmbedRequestOptions) -> CpmResult<Matrix> {
        self.ensure_started()?;
        self.next_id += 1;
        let request_id = self.next_id;

        let request = serde_json::json!({
            "id": request_id,
            "texts": texts,
            "options": options,
        });
        {
            let process = self.process.as_mut().expect("worker started");
            writeln!(process.stdin, "{request}")
                .and_then(|_| process.stdin.flush())
                .map_err(|e| CpmError::worker_crashed(format!("worker write failed: {e}")))?;
        }

        let line = {
            let process = self.process.as_mut().expect("worker started");
            match process.stdout_rx.recv_timeout(self.request_timeout) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    let _ = process.child.kill();
                    self.process = None;
                    return Err(self.error_with_tail("worker request timeout"));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.process = None;
                    return Err(self.error_with_tail("worker exited mid-request"));
                }
            }
        };

        let response: WorkerResponse = serde_json::from_str(&line)
            .map_err(|_| self.error_with_tail(format!("invalid worker response: {line:?}")))?;
        if response.id != request_id {
            return Err(CpmError::worker_crashed(format!(
                "worker response id mismatch: got {} expected {request_id}",
                response.id
            )));
        }
        if !response.ok {
            let mut message = response.error.unwrap_or_else(|| "worker error".to_string());
            if let Some(trace) = response.trace.filter(|t| !t.is_empty()) {
                message.push('\n');
                message.push_str(&trace);
            }
            return Err(CpmError::worker_crashed(message));
        }

        let matrix = Matrix::from_rows(&response.vectors)?;
        self.dim = if response.dim > 0 {
            response.dim
        } else {
            matrix.dim()
        };
        Ok(matrix)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn close(&mut self) {
        if let Some(mut process) = self.process.take() {
            let _ = writeln!(process.stdin, "{}", serde_json::json!({"op": "shutdown"}));
            let _ = process.stdin.flush();
            std::thread::sleep(Duration::from_millis(100));
            let _ = process.child.kill();
            let _ = process.child.wait();
        }
    }
}

impl Drop for SubprocessDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_worker(script: &str) -> SubprocessDriver {
        SubprocessDriver::new(
            "test-model",
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            None,
            BTreeMap::new(),
            5.0,
            5.0,
        )
    }

    #[test]
    fn handshake_then_roundtrip() {
        // A worker that answers every request with a fixed 2-D vector. The
        // `id` of the request is echoed back by parsing it crudely.
        let script = r#"
echo "READY test"
while read -r line; do
  case "$line" in
    *shutdown*) exit 0 ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo "{\"id\": $id, \"ok\": true, \"vectors\": [[1.0, 0.0]], \"dim\": 2}"
done
"#;
        let mut driver = sh_worker(script);
        driver.warmup().unwrap();
        let m = driver
            .embed(&["hello".to_string()], &EmbedRequestOptions::default())
            .unwrap();
        assert_eq!(m.nrows(), 1);
        assert_eq!(m.dim(), 2);
        assert_eq!(driver.dim(), 2);
        driver.close();
    }

    #[test]
    fn handshake_failure_includes_stderr_tail() {
        let script = r#"
echo "model exploded" >&2
echo "NOT-READY"
sleep 5
"#;
        let mut driver = sh_worker(script);
        let err = driver.warmup().unwrap_err();
        assert_eq!(err.kind, cpm_core::errors::ErrorKind::WorkerCrashed);
        assert!(err.message.contains("handshake failed"));
    }

    #[test]
    fn worker_error_propagates() {
        let script = r#"
echo "READY"
while read -r line; do
  case "$line" in
    *shutdown*) exit 0 ;;
  esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo "{\"id\": $id, \"ok\": false, \"error\": \"oom\", \"trace\": \"line1\"}"
done
"#;
        let mut driver = sh_worker(script);
        let err = driver
            .embed(&["x".to_string()], &EmbedRequestOptions::default())
            .unwrap_err();
        assert!(err.message.contains("oom"));
        assert!(err.message.contains("line1"));
    }
}
