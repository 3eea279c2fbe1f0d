//! Child side of the worker pool.
//!
//! A worker reads [`WorkerRequest`] frames from its stdin, runs each job
//! through a [`JobRunner`] on a blocking thread and answers with a
//! [`RunJobResponse`]. A watchdog enforces the deadline: it cancels the job's
//! token when the deadline passes and, if the job has not unwound after the
//! grace period, kills every job process group and exits the process with
//! [`TIMEOUT_EXIT_CODE`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{Result, RunnerError};
use crate::job::JobId;
use crate::oops::OopsContext;
use crate::process_group;
use crate::runnable::JobError;
use crate::runner::JobRunner;
use crate::services::Services;
use crate::worker::protocol::{self, RunJobResponse, WorkerRequest, TIMEOUT_EXIT_CODE};

/// Called with the exit code when a job overruns its grace period.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Kills the job's command process groups, then exits the worker.
pub fn process_exit() -> ExitHook {
    Arc::new(|code: i32| {
        let killed = process_group::kill_all();
        tracing::info!(groups = killed, "Killed job process groups before exiting");
        std::process::exit(code);
    })
}

/// Per-process setup done once when a worker starts.
#[derive(Debug)]
pub struct WorkerEnvironment {
    pid: u32,
}

impl WorkerEnvironment {
    pub fn enter(memory_limit_bytes: Option<u64>) -> Result<Self> {
        if let Some(limit) = memory_limit_bytes {
            apply_memory_limit(limit)?;
            tracing::info!(limit_bytes = limit, "Applied worker memory limit");
        }
        let pid = std::process::id();
        tracing::info!(pid, "Worker ready");
        Ok(Self { pid })
    }
}

impl Drop for WorkerEnvironment {
    fn drop(&mut self) {
        tracing::info!(pid = self.pid, "Worker exiting");
    }
}

#[cfg(unix)]
fn apply_memory_limit(limit: u64) -> Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let (_, hard) = getrlimit(Resource::RLIMIT_AS).map_err(std::io::Error::from)?;
    setrlimit(Resource::RLIMIT_AS, limit.min(hard), hard).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_memory_limit(_limit: u64) -> Result<()> {
    tracing::warn!("Memory limits are not supported on this platform");
    Ok(())
}

/// Serves requests until the driver closes the connection.
pub async fn serve<R, W>(
    services: Services,
    grace: Duration,
    reader: R,
    writer: W,
    exit: ExitHook,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, protocol::codec());
    let mut responses = FramedWrite::new(writer, protocol::codec());

    while let Some(frame) = requests.next().await {
        let request: WorkerRequest = protocol::decode(&frame?)?;
        let response = match request {
            WorkerRequest::RunJob { job_id, deadline } => {
                let deadline = DateTime::from_timestamp(deadline, 0).ok_or_else(|| {
                    RunnerError::Protocol(format!("deadline out of range: {deadline}"))
                })?;
                run_job(&services, job_id, deadline, grace, exit.clone()).await
            }
        };
        responses.send(protocol::encode(&response)?).await?;
    }
    tracing::debug!("Driver closed the connection");
    Ok(())
}

async fn run_job(
    services: &Services,
    job_id: JobId,
    deadline: DateTime<Utc>,
    grace: Duration,
    exit: ExitHook,
) -> RunJobResponse {
    let token = CancellationToken::new();
    let watchdog = tokio::spawn(watchdog(
        deadline,
        grace,
        token.clone(),
        services.clock.clone(),
        exit,
    ));

    let job_services = services.clone();
    let outcome =
        tokio::task::spawn_blocking(move || run_blocking(job_services, job_id, token)).await;
    watchdog.abort();

    match outcome {
        Ok(response) => response,
        // The pool treats the worker as crashed; dying here is the isolation.
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            tracing::error!(job_id, error = %e, "Job task was cancelled");
            RunJobResponse::incomplete(None)
        }
    }
}

fn run_blocking(services: Services, job_id: JobId, token: CancellationToken) -> RunJobResponse {
    let mut job = match services.load(job_id) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id, error = %e, "Could not load job");
            let context = OopsContext::default().with_var("job_id", job_id.to_string());
            let report = services.reporter.raising(&JobError::from(e), context);
            return RunJobResponse::incomplete(Some(report.id));
        }
    };

    let mut runner = JobRunner::new(services).with_cancellation(token);
    let report = runner.run_job_handle_error(&mut job);
    if runner.completed_jobs().contains(&job_id) {
        RunJobResponse::completed()
    } else {
        RunJobResponse::incomplete(report.map(|r| r.id))
    }
}

async fn watchdog(
    deadline: DateTime<Utc>,
    grace: Duration,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
    exit: ExitHook,
) {
    let remaining = (deadline - clock.now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(remaining).await;
    tracing::warn!("Job deadline reached, cancelling");
    token.cancel();

    tokio::time::sleep(grace).await;
    tracing::error!(
        exit_code = TIMEOUT_EXIT_CODE,
        "Job did not stop within the grace period, exiting"
    );
    exit(TIMEOUT_EXIT_CODE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::RunnerConfig;
    use crate::job::NewJob;
    use crate::oops::MemoryPublisher;
    use crate::registry::JobRegistry;
    use crate::runnable::{JobBody, RunContext};
    use crate::store::{JobStore, MemoryStore};

    struct Sleeper {
        ignore_cancel: bool,
    }

    impl JobBody for Sleeper {
        fn class_name(&self) -> &'static str {
            "Sleeper"
        }

        fn run(&mut self, ctx: &mut RunContext<'_>) -> std::result::Result<(), JobError> {
            if self.ignore_cancel {
                std::thread::sleep(Duration::from_millis(400));
                return Ok(());
            }
            for _ in 0..200 {
                ctx.check_deadline()?;
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }
    }

    fn services(ignore_cancel: bool) -> (Services, Arc<MemoryPublisher>) {
        let mut registry = JobRegistry::new();
        registry.register("Sleeper", move |_job: &crate::job::Job| {
            Ok(Box::new(Sleeper { ignore_cancel }) as Box<dyn JobBody>)
        });
        let publisher = Arc::new(MemoryPublisher::new());
        let services = Services::new(
            Arc::new(MemoryStore::new()),
            registry,
            RunnerConfig::default(),
        )
        .with_publisher(publisher.clone());
        (services, publisher)
    }

    fn leased_job(services: &Services) -> JobId {
        let job = services.create_job(NewJob::new("Sleeper")).unwrap();
        let mut runnable = services.runnable(job).unwrap();
        runnable.acquire_lease(Some(Duration::from_secs(60))).unwrap();
        services.store.commit().unwrap();
        runnable.id()
    }

    #[tokio::test]
    async fn cancelled_job_reports_timeout_oops() {
        let (services, publisher) = services(false);
        let job_id = leased_job(&services);
        let exit_codes = Arc::new(Mutex::new(Vec::new()));
        let codes = exit_codes.clone();
        let exit: ExitHook = Arc::new(move |code: i32| codes.lock().unwrap().push(code));

        let response = run_job(
            &services,
            job_id,
            Utc::now(),
            Duration::from_secs(5),
            exit,
        )
        .await;

        assert!(!response.succeeded());
        let report = publisher.find(&response.oops_id).unwrap();
        assert_eq!(report.kind, "TimeoutError");
        assert!(exit_codes.lock().unwrap().is_empty());
        assert_eq!(
            services.store.get(job_id).unwrap().status,
            crate::job::JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn stuck_job_triggers_timeout_exit() {
        let (services, _publisher) = services(true);
        let job_id = leased_job(&services);
        let exit_codes = Arc::new(Mutex::new(Vec::new()));
        let codes = exit_codes.clone();
        let exit: ExitHook = Arc::new(move |code: i32| codes.lock().unwrap().push(code));

        run_job(
            &services,
            job_id,
            Utc::now(),
            Duration::from_millis(50),
            exit,
        )
        .await;

        assert_eq!(*exit_codes.lock().unwrap(), vec![TIMEOUT_EXIT_CODE]);
    }

    #[tokio::test]
    async fn serve_answers_each_request() {
        let (services, _publisher) = services(false);
        let job_id = leased_job(&services);
        let (driver, worker) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let (driver_read, driver_write) = tokio::io::split(driver);

        let server = tokio::spawn(serve(
            services.clone(),
            Duration::from_secs(1),
            worker_read,
            worker_write,
            Arc::new(|_: i32| {}),
        ));

        let mut requests = FramedWrite::new(driver_write, protocol::codec());
        let mut responses = FramedRead::new(driver_read, protocol::codec());
        let deadline = (Utc::now() + chrono::Duration::seconds(30)).timestamp();
        requests
            .send(protocol::encode(&WorkerRequest::RunJob { job_id, deadline }).unwrap())
            .await
            .unwrap();

        let frame = responses.next().await.unwrap().unwrap();
        let response: RunJobResponse = protocol::decode(&frame).unwrap();
        assert_eq!(response, RunJobResponse::completed());

        SinkExt::<bytes::Bytes>::close(&mut requests).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
