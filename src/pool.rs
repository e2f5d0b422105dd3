//! Isolated worker-process pool for document conversion (spec.md §4.C).
//!
//! Grounded on the subprocess-with-timeout pattern from
//! `leynos-pg-embedded-setup-unpriv`'s `worker_process` module, adapted to
//! async `tokio::process` and to re-exec the current binary (hidden
//! `--convert-worker <payload-path>` subcommand, see `main.rs`): one
//! `[[bin]]` target, no second Cargo artifact.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{ErrorKind, IngestError};

pub const POOL_SIZE: usize = 8;
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(1800);

/// Thread caps applied to every worker process before it initializes its
/// converter singleton, to prevent thread explosion on shared hosts
/// (`handlers/file.py`'s `init_worker`).
const THREAD_CAP_ENV: &[(&str, &str)] = &[
    ("OMP_NUM_THREADS", "2"),
    ("MKL_NUM_THREADS", "2"),
    ("OPENBLAS_NUM_THREADS", "2"),
    ("VECLIB_MAXIMUM_THREADS", "2"),
    ("NUMEXPR_NUM_THREADS", "2"),
    ("ONNX_NUM_THREADS", "1"),
    ("OMP_THREAD_LIMIT", "2"),
];

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub ok: bool,
    pub markdown: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// A pool of OS-process-isolated conversion workers.
///
/// Liveness is tracked with a single flag: any worker I/O error marks the
/// pool broken, and the next submission discards and rebuilds it rather than
/// trying to nurse the existing one back to health.
pub struct WorkerPool {
    self_exe: PathBuf,
    permits: Semaphore,
    alive: AtomicBool,
}

impl WorkerPool {
    pub fn new(self_exe: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            self_exe,
            permits: Semaphore::new(POOL_SIZE),
            alive: AtomicBool::new(true),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Submit a conversion job. Discards and rebuilds pool state first if the
    /// liveness flag is currently false (spec.md §4.C "Pool recovery").
    pub async fn submit(&self, path: &Path) -> Result<WorkerResponse, IngestError> {
        if !self.is_alive() {
            info!("worker pool liveness flag was false; rebuilding before submission");
            self.alive.store(true, Ordering::SeqCst);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IngestError::new(ErrorKind::Timeout, "worker pool semaphore closed"))?;
        self.run_worker(path).await
    }

    async fn run_worker(&self, path: &Path) -> Result<WorkerResponse, IngestError> {
        let payload = WorkerRequest { path: path.to_path_buf() };
        let payload_file =
            write_payload(&payload).map_err(|e| IngestError::new(ErrorKind::InvalidFormat, format!("failed to write worker payload: {e}")))?;

        let mut command = Command::new(&self.self_exe);
        command.arg("--convert-worker").arg(payload_file.path());
        for (key, value) in THREAD_CAP_ENV {
            command.env(key, value);
        }
        command.kill_on_drop(true);
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            IngestError::new(ErrorKind::Timeout, format!("failed to spawn conversion worker: {e}"))
        })?;

        let wait = tokio::time::timeout(WORKER_TIMEOUT, child.wait_with_output()).await;

        match wait {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(IngestError::new(ErrorKind::InvalidFormat, format!("conversion worker exited with error: {stderr}")));
                }
                serde_json::from_slice::<WorkerResponse>(&output.stdout)
                    .map_err(|e| IngestError::new(ErrorKind::InvalidFormat, format!("malformed worker response: {e}")))
            }
            Ok(Err(e)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(IngestError::new(ErrorKind::Timeout, format!("failed to wait for conversion worker: {e}")))
            }
            Err(_) => {
                // Hard wall-clock timeout: the worker MUST be terminated, not signalled.
                warn!(path = %path.display(), "conversion worker exceeded hard timeout, killing");
                self.alive.store(false, Ordering::SeqCst);
                Err(IngestError::new(ErrorKind::Timeout, format!("conversion timed out after {:?}", WORKER_TIMEOUT)))
            }
        }
    }
}

fn write_payload(payload: &WorkerRequest) -> std::io::Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()?;
    let bytes = serde_json::to_vec(payload)?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(file)
}

/// Entry point for the `--convert-worker <payload-path>` subcommand (see
/// `main.rs`). Runs in the freshly-spawned child process: reads the request,
/// converts, and writes a [`WorkerResponse`] to stdout as its sole output.
pub async fn run_convert_worker(payload_path: &Path) -> std::io::Result<()> {
    let bytes = tokio::fs::read(payload_path).await?;
    let request: WorkerRequest = serde_json::from_slice(&bytes).unwrap_or(WorkerRequest { path: PathBuf::new() });

    let converter = crate::file::default_converter();
    let response = match converter.convert(&request.path).await {
        Ok(output) => WorkerResponse {
            ok: true,
            markdown: Some(output.markdown),
            metadata: Some(output.metadata),
            error: None,
        },
        Err(e) => WorkerResponse {
            ok: false,
            markdown: None,
            metadata: None,
            error: Some(e.message),
        },
    };

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&serde_json::to_vec(&response)?).await?;
    stdout.flush().await?;
    Ok(())
}
