use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RunnerError};
use crate::job::JobId;
use crate::oops::OopsReport;
use crate::runnable::{Classification, FailureKind, JobError, RunnableJob};
use crate::runner::sync::{ready_runnables, requeue_expired};
use crate::services::Services;
use crate::worker::{DispatchError, RunJobResponse, WorkerPool};

/// Runs jobs in worker subprocesses, up to `max_workers` at a time, from a
/// single-threaded event loop.
#[derive(Debug)]
pub struct PoolRunner {
    services: Services,
    pool: Arc<WorkerPool>,
    completed_jobs: Vec<JobId>,
    incomplete_jobs: Vec<JobId>,
    oops_reports: Vec<OopsReport>,
    oops_ids: Vec<String>,
}

impl PoolRunner {
    pub fn new(services: Services) -> Self {
        let pool = WorkerPool::new(services.config.pool.clone(), services.clock.clone());
        Self {
            services,
            pool: Arc::new(pool),
            completed_jobs: Vec::new(),
            incomplete_jobs: Vec::new(),
            oops_reports: Vec::new(),
            oops_ids: Vec::new(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn completed_jobs(&self) -> &[JobId] {
        &self.completed_jobs
    }

    pub fn incomplete_jobs(&self) -> &[JobId] {
        &self.incomplete_jobs
    }

    /// Reports filed by the driver for workers that died.
    pub fn oops_reports(&self) -> &[OopsReport] {
        &self.oops_reports
    }

    /// Ids of every OOPS seen, whether filed by a worker or by the driver.
    pub fn oops_ids(&self) -> &[String] {
        &self.oops_ids
    }

    pub async fn run_ready(&mut self) -> Result<()> {
        requeue_expired(&self.services)?;
        let jobs = ready_runnables(&self.services)?;
        self.run_all(jobs).await
    }

    /// Polls for ready jobs every `interval` until `shutdown` is cancelled.
    pub async fn run_loop(
        &mut self,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Pool runner shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_ready().await {
                        tracing::error!(error = %e, "Pool pass failed");
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Dispatches `jobs` to workers. A store error stops further dispatch;
    /// jobs already handed to workers are still awaited and recorded before
    /// the error is returned.
    pub async fn run_all(&mut self, jobs: Vec<RunnableJob>) -> Result<()> {
        let max_workers = self.services.config.pool.max_workers.max(1);
        let mut pending = jobs.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut failure = None;

        loop {
            while failure.is_none() && in_flight.len() < max_workers {
                let Some(mut job) = pending.next() else {
                    break;
                };
                let deadline = match self.lease(&mut job) {
                    Ok(Some(deadline)) => deadline,
                    Ok(None) => {
                        self.incomplete_jobs.push(job.id());
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(
                            job_id = job.id(),
                            in_flight = in_flight.len(),
                            error = %e,
                            "Stopping dispatch, waiting for running jobs"
                        );
                        failure = Some(e);
                        break;
                    }
                };

                tracing::info!(job_id = job.id(), "Running {job} in a worker");
                let pool = self.pool.clone();
                in_flight.push(async move {
                    let result = pool.run_job(job.id(), deadline).await;
                    (job, result)
                });
            }

            match in_flight.next().await {
                Some((job, result)) => self.handle_result(job, result),
                None => break,
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Leases `job` and commits. `None` when another runner holds the lease.
    fn lease(&self, job: &mut RunnableJob) -> Result<Option<DateTime<Utc>>> {
        match job.acquire_lease(None) {
            Ok(()) => {}
            Err(e) if e.is_lease_held() => {
                tracing::info!(job_id = job.id(), "Could not acquire lease for {job}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        // Release the row lock taken while leasing before dispatching.
        self.services.store.commit()?;
        job.lease_expires().map(Some).ok_or_else(|| {
            RunnerError::Internal(format!("job {} leased without expiry", job.id()))
        })
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub fn log_summary(&self) {
        tracing::info!("Ran {} jobs.", self.completed_jobs.len());
        if !self.incomplete_jobs.is_empty() {
            tracing::info!("{} jobs did not complete.", self.incomplete_jobs.len());
        }
    }

    fn handle_result(
        &mut self,
        job: RunnableJob,
        result: std::result::Result<RunJobResponse, DispatchError>,
    ) {
        match result {
            Ok(response) if response.succeeded() => {
                tracing::info!(job_id = job.id(), "Job {} completed", job.id());
                self.completed_jobs.push(job.id());
            }
            Ok(response) => {
                self.incomplete_jobs.push(job.id());
                if response.oops_id.is_empty() {
                    tracing::info!(job_id = job.id(), "Incomplete {job}");
                } else {
                    tracing::info!(job_id = job.id(), oops_id = %response.oops_id, "Job raised an OOPS");
                    self.oops_ids.push(response.oops_id);
                }
            }
            Err(e) => {
                self.incomplete_jobs.push(job.id());
                let err = if e.is_timeout() {
                    tracing::info!(job_id = job.id(), "Job timed out: {job}");
                    JobError::timeout(format!("{job} exceeded its deadline"))
                } else {
                    tracing::error!(job_id = job.id(), error = %e, "Worker failed running {job}");
                    JobError::with_source(
                        FailureKind::WORKER_EXITED,
                        format!("worker running {job} did not answer"),
                        e,
                    )
                };
                self.handle_dispatch_failure(job, err);
            }
        }
    }

    /// Applies the job's failure policy on behalf of a worker that died.
    fn handle_dispatch_failure(&mut self, mut job: RunnableJob, err: JobError) {
        let recorded = job.refresh().and_then(|()| {
            if job.status().is_terminal() {
                return Ok(false);
            }
            if job.classify(&err) == Classification::Retry && !job.retries_exhausted() {
                job.queue(true)?;
                return Ok(true);
            }
            job.fail(true)?;
            Ok(false)
        });
        match recorded {
            Ok(true) => {
                tracing::info!(job_id = job.id(), error = %err, "Scheduling retry");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(job_id = job.id(), error = %e, "Failed to record worker failure");
            }
        }

        if job.classify(&err) == Classification::User {
            if let Err(e) = job.notify_user_error(&err) {
                tracing::warn!(job_id = job.id(), error = %e, "Failed to send user error mail");
            }
            return;
        }
        let report = self.services.reporter.raising(&err, job.oops_context());
        tracing::info!(job_id = job.id(), oops_id = %report.id, "Job raised an OOPS");
        if let Err(e) = job.notify_oops(&report) {
            tracing::warn!(job_id = job.id(), error = %e, "Failed to send OOPS mail");
        }
        self.oops_ids.push(report.id.clone());
        self.oops_reports.push(report);
    }
}
