//! Job bodies and the lifecycle wrapper around them.
//!
//! A [`JobBody`] is the business logic of one job class plus its failure
//! policy. [`RunnableJob`] binds a body to its persisted [`Job`] record and
//! to the shared [`Services`], and exposes only the lifecycle operations
//! runners need: lease, start, complete, fail, queue, run.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::chrono_duration;
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use crate::metrics::{JOB_COMPLETE, JOB_FAIL, JOB_QUEUE, JOB_START};
use crate::oops::{OopsContext, OopsReport};
use crate::services::Services;

pub mod backoff;
pub mod context;
pub mod failure;

pub use backoff::{BackoffPolicy, FixedBackoff, SteppedBackoff, DEFAULT_RETRY_DELAY};
pub use context::{Deadline, RunContext};
pub use failure::{Classification, FailureKind, JobError};

/// Business logic and failure policy of one job class.
pub trait JobBody: Send {
    /// Class name; matches `Job::job_type` and the delegation flag.
    fn class_name(&self) -> &'static str;

    fn module_name(&self) -> &'static str {
        "job_runner"
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> std::result::Result<(), JobError>;

    /// Failures that are the requester's fault.
    fn user_error_types(&self) -> &[FailureKind] {
        &[]
    }

    /// Failures worth retrying later.
    fn retry_error_types(&self) -> &[FailureKind] {
        &[]
    }

    /// Retry bound; `None` retries for as long as the failure stays retryable.
    fn max_retries(&self) -> Option<u32> {
        None
    }

    fn backoff(&self) -> &dyn BackoffPolicy {
        &backoff::DEFAULT_BACKOFF
    }

    fn lease_duration(&self) -> Option<Duration> {
        None
    }

    fn oops_recipients(&self) -> Vec<String> {
        Vec::new()
    }

    fn error_recipients(&self) -> Vec<String> {
        Vec::new()
    }

    fn operation_description(&self) -> String {
        "unknown".to_string()
    }

    fn oops_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

pub struct RunnableJob {
    job: Job,
    body: Box<dyn JobBody>,
    services: Services,
}

impl RunnableJob {
    pub fn new(job: Job, body: Box<dyn JobBody>, services: Services) -> Self {
        Self {
            job,
            body,
            services,
        }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn class_name(&self) -> &'static str {
        self.body.class_name()
    }

    pub fn module_name(&self) -> &'static str {
        self.body.module_name()
    }

    pub fn status(&self) -> JobStatus {
        self.job.status
    }

    pub fn lease_expires(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.job.lease_expires
    }

    pub fn attempt_count(&self) -> u32 {
        self.job.attempt_count
    }

    /// Reloads the record from the store.
    pub fn refresh(&mut self) -> Result<()> {
        self.job = self.services.store.get(self.job.id)?;
        Ok(())
    }

    /// Claims exclusive rights to run this job. Fails with `LeaseHeld` when
    /// another runner holds a valid lease or the job is already finished.
    pub fn acquire_lease(&mut self, duration: Option<Duration>) -> Result<()> {
        let duration = duration
            .or_else(|| self.body.lease_duration())
            .unwrap_or(self.services.config.lease_duration);
        let now = self.services.clock.now();
        let expires = now + chrono_duration(duration);
        self.job = self
            .services
            .store
            .try_acquire_lease(self.job.id, expires, now)?;
        Ok(())
    }

    pub fn start(&mut self, manage_transaction: bool) -> Result<()> {
        self.job.start(self.services.clock.now())?;
        self.services.store.save(&self.job)?;
        self.services.metrics.increment(JOB_START, self.class_name());
        if manage_transaction {
            self.services.store.commit()?;
        }
        Ok(())
    }

    pub fn complete(&mut self, manage_transaction: bool) -> Result<()> {
        if manage_transaction {
            // Publish whatever the body left uncommitted before finishing.
            self.services.store.commit()?;
        }
        self.job.complete(self.services.clock.now())?;
        self.services.store.save(&self.job)?;
        self.services.metrics.increment(JOB_COMPLETE, self.class_name());
        if manage_transaction {
            self.services.store.commit()?;
        }
        Ok(())
    }

    /// Marks the job FAILED. With `manage_transaction`, uncommitted work from
    /// the failed run is rolled back first.
    pub fn fail(&mut self, manage_transaction: bool) -> Result<()> {
        if manage_transaction {
            self.services.store.abort()?;
            self.refresh()?;
        }
        self.job.fail(self.services.clock.now())?;
        self.services.store.save(&self.job)?;
        self.services.metrics.increment(JOB_FAIL, self.class_name());
        if manage_transaction {
            self.services.store.commit()?;
        }
        Ok(())
    }

    /// Returns the job to WAITING, pushing `scheduled_start` out by the
    /// backoff if it has been attempted before.
    pub fn queue(&mut self, manage_transaction: bool) -> Result<()> {
        let next_start = if self.job.attempt_count > 0 {
            let delay = self.body.backoff().delay(self.job.attempt_count);
            let base = self.job.scheduled_start.max(self.services.clock.now());
            Some(base + chrono_duration(delay))
        } else {
            None
        };
        self.job.queue(next_start)?;
        self.services.store.save(&self.job)?;
        self.services.metrics.increment(JOB_QUEUE, self.class_name());
        self.delegate_on_commit();
        if manage_transaction {
            self.services.store.commit()?;
        }
        Ok(())
    }

    /// Deadline derived from the current lease.
    pub fn deadline(&self, token: CancellationToken) -> Deadline {
        Deadline::new(self.job.lease_expires, token, self.services.clock.clone())
    }

    pub fn run(&mut self, deadline: &Deadline) -> std::result::Result<(), JobError> {
        let store = self.services.store.as_ref();
        let mut ctx = RunContext::new(&mut self.job, store, deadline);
        self.body.run(&mut ctx)
    }

    pub fn classify(&self, err: &JobError) -> Classification {
        if self.body.user_error_types().contains(&err.kind()) {
            Classification::User
        } else if self.body.retry_error_types().contains(&err.kind()) {
            Classification::Retry
        } else {
            Classification::Unclassified
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.body
            .max_retries()
            .is_some_and(|max| self.job.attempt_count > max)
    }

    pub fn oops_recipients(&self) -> Vec<String> {
        self.body.oops_recipients()
    }

    pub fn error_recipients(&self) -> Vec<String> {
        self.body.error_recipients()
    }

    pub fn operation_description(&self) -> String {
        self.body.operation_description()
    }

    pub fn oops_context(&self) -> OopsContext {
        let mut vars = vec![
            ("job_id".to_string(), self.job.id.to_string()),
            ("job_type".to_string(), self.job.job_type.clone()),
            ("attempt_count".to_string(), self.job.attempt_count.to_string()),
        ];
        vars.extend(self.body.oops_vars());
        OopsContext {
            operation: Some(self.operation_description()),
            vars: vars.into_iter().collect(),
        }
    }

    /// Tells operators about an OOPS. Returns whether mail was sent.
    pub fn notify_oops(&self, report: &OopsReport) -> Result<bool> {
        self.services.notifier.notify_oops(
            &self.oops_recipients(),
            &self.operation_description(),
            report,
        )
    }

    /// Tells the requester why their job failed. Returns whether mail was sent.
    pub fn notify_user_error(&self, err: &JobError) -> Result<bool> {
        self.services.notifier.notify_user_error(
            &self.error_recipients(),
            &self.operation_description(),
            err,
        )
    }

    /// Arranges for the job to be handed to the task queue once the current
    /// transaction commits, if its class is enabled for delegation.
    pub fn delegate_on_commit(&self) -> bool {
        match &self.services.delegator {
            Some(delegator) => delegator.run_on_commit(self, self.services.store.as_ref()),
            None => false,
        }
    }
}

impl fmt::Display for RunnableJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ID {})", self.class_name(), self.job.id)
    }
}

impl fmt::Debug for RunnableJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableJob")
            .field("class", &self.class_name())
            .field("job", &self.job)
            .finish()
    }
}
