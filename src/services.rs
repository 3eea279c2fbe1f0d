//! Shared collaborators handed to runners, workers and runnable jobs.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::RunnerConfig;
use crate::delegation::Delegator;
use crate::error::Result;
use crate::job::{Job, JobId, NewJob};
use crate::metrics::{MetricsSink, NullMetrics};
use crate::notify::{LogMailer, Mailer, Notifier};
use crate::oops::{DirectoryPublisher, ErrorReporter, LogPublisher, OopsPublisher};
use crate::registry::JobRegistry;
use crate::runnable::RunnableJob;
use crate::store::JobStore;

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<JobRegistry>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
    pub reporter: Arc<ErrorReporter>,
    pub notifier: Arc<Notifier>,
    pub delegator: Option<Arc<Delegator>>,
    pub config: Arc<RunnerConfig>,
}

impl Services {
    /// Services with a system clock, no metrics, logged OOPSes and logged mail.
    pub fn new(store: Arc<dyn JobStore>, registry: JobRegistry, config: RunnerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let reporter = ErrorReporter::new(
            config.oops.reporter.clone(),
            Arc::new(LogPublisher),
            clock.clone(),
        );
        let notifier = Notifier::new(Arc::new(LogMailer), config.from_address.clone());
        Self {
            store,
            registry: Arc::new(registry),
            clock,
            metrics: Arc::new(NullMetrics),
            reporter: Arc::new(reporter),
            notifier: Arc::new(notifier),
            delegator: None,
            config: Arc::new(config),
        }
    }

    /// Uses a directory publisher when `config.oops.publish_dir` is set.
    pub fn with_configured_publisher(self) -> Result<Self> {
        match self.config.oops.publish_dir.clone() {
            Some(dir) => Ok(self.with_publisher(Arc::new(DirectoryPublisher::new(dir)?))),
            None => Ok(self),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        let publisher = self.reporter.publisher().clone();
        self.with_publisher(publisher)
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn OopsPublisher>) -> Self {
        self.reporter = Arc::new(ErrorReporter::new(
            self.config.oops.reporter.clone(),
            publisher,
            self.clock.clone(),
        ));
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.notifier = Arc::new(Notifier::new(mailer, self.config.from_address.clone()));
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<Delegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    /// Inserts a job. Jobs of delegated classes are also handed to the task
    /// queue when the current transaction commits.
    pub fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = self.store.create(new_job, self.clock.now())?;
        if self.is_delegated(&job.job_type) && self.registry.contains(&job.job_type) {
            self.runnable(job.clone())?.delegate_on_commit();
        }
        Ok(job)
    }

    /// Wraps `job` with the body its type is registered under.
    pub fn runnable(&self, job: Job) -> Result<RunnableJob> {
        let body = self.registry.build(&job)?;
        Ok(RunnableJob::new(job, body, self.clone()))
    }

    pub fn load(&self, id: JobId) -> Result<RunnableJob> {
        let job = self.store.get(id)?;
        self.runnable(job)
    }

    /// Class names whose jobs are handed to the task queue instead of
    /// running locally.
    pub fn is_delegated(&self, job_type: &str) -> bool {
        self.delegator
            .as_ref()
            .is_some_and(|d| d.enabled_for(job_type))
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("registry", &self.registry)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}
