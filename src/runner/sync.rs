use tokio_util::sync::CancellationToken;

use crate::error::{Result, RunnerError};
use crate::job::JobId;
use crate::oops::OopsReport;
use crate::runnable::{Classification, JobError, RunnableJob};
use crate::services::Services;

/// Runs jobs one after another in the calling thread.
///
/// There is no isolation: a panic inside a job body unwinds through the
/// runner. Use [`PoolRunner`](crate::runner::PoolRunner) for untrusted bodies.
#[derive(Debug)]
pub struct JobRunner {
    services: Services,
    cancel: CancellationToken,
    completed_jobs: Vec<JobId>,
    incomplete_jobs: Vec<JobId>,
    oops_reports: Vec<OopsReport>,
}

impl JobRunner {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            cancel: CancellationToken::new(),
            completed_jobs: Vec::new(),
            incomplete_jobs: Vec::new(),
            oops_reports: Vec::new(),
        }
    }

    /// Cancelling `token` expires the deadline of whatever job is running.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn completed_jobs(&self) -> &[JobId] {
        &self.completed_jobs
    }

    pub fn incomplete_jobs(&self) -> &[JobId] {
        &self.incomplete_jobs
    }

    pub fn oops_reports(&self) -> &[OopsReport] {
        &self.oops_reports
    }

    /// Ready jobs, excluding classes delegated to the task queue and types
    /// this process has no body for.
    pub fn ready_jobs(&self) -> Result<Vec<RunnableJob>> {
        ready_runnables(&self.services)
    }

    /// Requeues lapsed RUNNING jobs, then runs everything that is ready.
    pub fn run_ready(&mut self) -> Result<()> {
        requeue_expired(&self.services)?;
        let jobs = self.ready_jobs()?;
        self.run_all(jobs)
    }

    pub fn run_all(&mut self, jobs: Vec<RunnableJob>) -> Result<()> {
        for mut job in jobs {
            match job.acquire_lease(None) {
                Ok(()) => {}
                Err(e) if e.is_lease_held() => {
                    tracing::info!(job_id = job.id(), "Could not acquire lease for {job}");
                    self.incomplete_jobs.push(job.id());
                    continue;
                }
                Err(e) => return Err(e),
            }
            // Release the row lock taken while leasing before the body runs.
            self.services.store.commit()?;
            if let Some(report) = self.run_job_handle_error(&mut job) {
                tracing::info!(job_id = job.id(), oops_id = %report.id, "Job raised an OOPS");
            }
        }
        Ok(())
    }

    /// Runs one leased job and applies its failure policy. Returns the error
    /// that should be reported, if any.
    pub fn run_job(&mut self, job: &mut RunnableJob) -> std::result::Result<(), JobError> {
        tracing::info!(job_id = job.id(), "Running {job}");
        if let Err(e) = job.start(true) {
            self.incomplete_jobs.push(job.id());
            return Err(e.into());
        }

        let deadline = job.deadline(self.cancel.child_token());
        let err = match job.run(&deadline) {
            Ok(()) => {
                if let Err(e) = job.complete(true) {
                    self.incomplete_jobs.push(job.id());
                    return Err(e.into());
                }
                tracing::info!(job_id = job.id(), "Job {} completed", job.id());
                self.completed_jobs.push(job.id());
                return Ok(());
            }
            Err(err) => err,
        };

        self.incomplete_jobs.push(job.id());
        if job.classify(&err) == Classification::Retry && !job.retries_exhausted() {
            tracing::info!(
                job_id = job.id(),
                error = %err,
                attempt = job.attempt_count(),
                "Scheduling retry"
            );
            job.queue(true)?;
            return Ok(());
        }

        if let Err(e) = job.fail(true) {
            tracing::error!(job_id = job.id(), error = %e, "Failed to mark job as failed");
        }
        Err(err)
    }

    /// Runs `job` and turns any failure into a user notification or an OOPS.
    pub fn run_job_handle_error(&mut self, job: &mut RunnableJob) -> Option<OopsReport> {
        let err = match self.run_job(job) {
            Ok(()) => return None,
            Err(err) => err,
        };

        if job.classify(&err) == Classification::User {
            tracing::info!(job_id = job.id(), error = %err, "Job failed with a user error");
            if let Err(e) = job.notify_user_error(&err) {
                tracing::warn!(job_id = job.id(), error = %e, "Failed to send user error mail");
            }
            return None;
        }

        let report = self.services.reporter.raising(&err, job.oops_context());
        if let Err(e) = job.notify_oops(&report) {
            tracing::warn!(job_id = job.id(), error = %e, "Failed to send OOPS mail");
        }
        self.oops_reports.push(report.clone());
        Some(report)
    }

    pub fn log_summary(&self) {
        tracing::info!("Ran {} jobs.", self.completed_jobs.len());
        if !self.incomplete_jobs.is_empty() {
            tracing::info!("{} jobs did not complete.", self.incomplete_jobs.len());
        }
    }
}

/// Builds runnables for every ready job the local process should run.
pub(crate) fn ready_runnables(services: &Services) -> Result<Vec<RunnableJob>> {
    let now = services.clock.now();
    let mut runnables = Vec::new();
    for job in services.store.ready_jobs(now)? {
        if services.is_delegated(&job.job_type) {
            tracing::debug!(job_id = job.id, job_type = %job.job_type, "Skipping delegated job");
            continue;
        }
        match services.runnable(job) {
            Ok(runnable) => runnables.push(runnable),
            Err(RunnerError::UnknownJobType(job_type)) => {
                tracing::warn!(job_type = %job_type, "No body registered for job type");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(runnables)
}

pub(crate) fn requeue_expired(services: &Services) -> Result<()> {
    let requeued = services.store.requeue_expired(services.clock.now())?;
    if !requeued.is_empty() {
        tracing::warn!(jobs = ?requeued, "Requeued jobs whose lease expired while running");
    }
    services.store.commit()
}
