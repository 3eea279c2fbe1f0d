use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::error::RunnerError;
use crate::job::JobId;
use crate::process_group;
use crate::worker::protocol::{self, RunJobResponse, WorkerRequest, TIMEOUT_EXIT_CODE};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Worker exited with code {exit_code:?}")]
    Exited { exit_code: Option<i32> },

    #[error("Worker did not answer before its deadline and was killed")]
    DeadlineExceeded,

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl DispatchError {
    /// Whether the worker ended through the deadline path rather than crashing.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DispatchError::DeadlineExceeded
                | DispatchError::Exited {
                    exit_code: Some(TIMEOUT_EXIT_CODE)
                }
        )
    }
}

/// One worker child with framed pipes to its stdin and stdout.
#[derive(Debug)]
struct WorkerProcess {
    id: usize,
    child: Child,
    requests: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    responses: FramedRead<ChildStdout, LengthDelimitedCodec>,
}

impl WorkerProcess {
    fn spawn(config: &PoolConfig, id: usize) -> Result<Self, RunnerError> {
        let mut command = Command::new(&config.worker_program);
        command.args(&config.worker_args);
        if let Some(limit) = config.memory_limit_bytes {
            command.arg(format!("--memory-limit={limit}"));
        }
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Internal("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Internal("worker stdout not captured".into()))?;

        tracing::info!(worker = id, pid = ?child.id(), "Started worker");
        Ok(Self {
            id,
            child,
            requests: FramedWrite::new(stdin, protocol::codec()),
            responses: FramedRead::new(stdout, protocol::codec()),
        })
    }

    async fn run_job(
        &mut self,
        job_id: JobId,
        deadline: i64,
        kill_after: Duration,
    ) -> Result<RunJobResponse, DispatchError> {
        let request = protocol::encode(&WorkerRequest::RunJob { job_id, deadline })?;
        if let Err(e) = self.requests.send(request).await {
            tracing::warn!(worker = self.id, error = %e, "Could not send job to worker");
            return Err(self.exited().await);
        }

        match tokio::time::timeout(kill_after, self.responses.next()).await {
            Ok(Some(Ok(frame))) => Ok(protocol::decode(&frame)?),
            Ok(Some(Err(e))) => Err(RunnerError::from(e).into()),
            Ok(None) => Err(self.exited().await),
            Err(_) => {
                tracing::warn!(worker = self.id, job_id, "Worker overran its deadline, killing");
                kill_worker(self.id, &mut self.child).await;
                Err(DispatchError::DeadlineExceeded)
            }
        }
    }

    async fn exited(&mut self) -> DispatchError {
        match self.child.wait().await {
            Ok(status) => {
                tracing::info!(worker = self.id, status = %status, "Worker exited");
                DispatchError::Exited {
                    exit_code: status.code(),
                }
            }
            Err(e) => RunnerError::from(e).into(),
        }
    }

    /// Closes the worker's stdin and waits for it to exit, killing it if it
    /// takes longer than `timeout`.
    async fn stop(self, timeout: Duration) {
        let WorkerProcess {
            id,
            mut child,
            requests,
            ..
        } = self;
        drop(requests);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(worker = id, status = %status, "Worker stopped"),
            Ok(Err(e)) => tracing::warn!(worker = id, error = %e, "Failed waiting for worker"),
            Err(_) => {
                tracing::warn!(worker = id, "Worker did not stop, killing");
                kill_worker(id, &mut child).await;
            }
        }
    }
}

/// Kills the worker's whole process group, then reaps the worker.
async fn kill_worker(id: usize, child: &mut Child) {
    if let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        if let Err(e) = process_group::kill_group(pgid) {
            tracing::error!(worker = id, error = %e, "Failed to kill worker process group");
        }
    }
    if let Err(e) = child.kill().await {
        tracing::error!(worker = id, error = %e, "Failed to kill worker");
    }
}

/// Lazily started worker processes. Callers bound concurrency; the pool only
/// keeps idle workers around for reuse.
#[derive(Debug)]
pub struct WorkerPool {
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    idle: Mutex<Vec<WorkerProcess>>,
    spawned: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            idle: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Workers started over the pool's lifetime.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Runs `job_id` in a worker. The worker is killed if it has not answered
    /// by `deadline` plus twice the grace period.
    pub async fn run_job(
        &self,
        job_id: JobId,
        deadline: DateTime<Utc>,
    ) -> Result<RunJobResponse, DispatchError> {
        let mut worker = self.checkout()?;
        let until_deadline = (deadline - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let kill_after = until_deadline + self.config.timeout_grace * 2;

        let result = worker
            .run_job(job_id, deadline.timestamp(), kill_after)
            .await;
        match &result {
            Ok(response) if response.succeeded() => self.checkin(worker),
            Ok(_) => {
                tracing::info!(worker = worker.id, job_id, "Stopping worker after incomplete job");
                worker.stop(self.config.stop_timeout).await;
            }
            // Dead or killed; dropping reaps it.
            Err(_) => {}
        }
        result
    }

    /// Stops every idle worker.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.idle.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            worker.stop(self.config.stop_timeout).await;
        }
    }

    fn checkout(&self) -> Result<WorkerProcess, RunnerError> {
        if let Some(worker) = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop() {
            return Ok(worker);
        }
        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        WorkerProcess::spawn(&self.config, id)
    }

    fn checkin(&self, worker: WorkerProcess) {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
    }
}
