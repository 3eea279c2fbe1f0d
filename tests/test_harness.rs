//! Test harness for runner integration tests.
//!
//! Provides an in-memory service stack with a manual clock, plus scripted job
//! bodies whose outcomes and call counts tests control.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use job_runner::clock::ManualClock;
use job_runner::config::RunnerConfig;
use job_runner::job::{Job, JobId, NewJob};
use job_runner::metrics::InMemoryMetrics;
use job_runner::notify::MemoryMailer;
use job_runner::oops::MemoryPublisher;
use job_runner::registry::JobRegistry;
use job_runner::runnable::{
    BackoffPolicy, FailureKind, FixedBackoff, JobBody, JobError, RunContext,
};
use job_runner::runner::JobRunner;
use job_runner::services::Services;
use job_runner::store::{JobStore, MemoryStore};

pub const SCRIPTED_JOB: &str = "ScriptedJob";
pub const TWO_STEP_JOB: &str = "TwoStepJob";

/// A failure kind job classes in these tests treat as the requester's fault.
pub const INVALID_INPUT: FailureKind = FailureKind::new("InvalidInput");
pub const VALUE_ERROR: FailureKind = FailureKind::new("ValueError");

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// Failure policy shared by every body built for one job class.
#[derive(Clone, Default)]
pub struct Policy {
    pub user_error_types: Vec<FailureKind>,
    pub retry_error_types: Vec<FailureKind>,
    pub max_retries: Option<u32>,
    pub backoff: FixedBackoff,
    pub oops_recipients: Vec<String>,
    pub error_recipients: Vec<String>,
}

/// Outcomes handed out one per run; an empty script means success.
#[derive(Clone, Default)]
pub struct Script {
    outcomes: Arc<Mutex<VecDeque<FailureKind>>>,
    runs: Arc<AtomicUsize>,
}

impl Script {
    pub fn failing_with(kinds: &[FailureKind]) -> Self {
        let script = Self::default();
        script.outcomes.lock().unwrap().extend(kinds.iter().copied());
        script
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<FailureKind> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().unwrap().pop_front()
    }
}

pub struct ScriptedJob {
    script: Script,
    policy: Policy,
}

impl JobBody for ScriptedJob {
    fn class_name(&self) -> &'static str {
        SCRIPTED_JOB
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> Result<(), JobError> {
        match self.script.next() {
            Some(kind) => Err(JobError::new(kind, "scripted failure")),
            None => Ok(()),
        }
    }

    fn user_error_types(&self) -> &[FailureKind] {
        &self.policy.user_error_types
    }

    fn retry_error_types(&self) -> &[FailureKind] {
        &self.policy.retry_error_types
    }

    fn max_retries(&self) -> Option<u32> {
        self.policy.max_retries
    }

    fn backoff(&self) -> &dyn BackoffPolicy {
        &self.policy.backoff
    }

    fn oops_recipients(&self) -> Vec<String> {
        self.policy.oops_recipients.clone()
    }

    fn error_recipients(&self) -> Vec<String> {
        self.policy.error_recipients.clone()
    }

    fn operation_description(&self) -> String {
        "running a scripted job".to_string()
    }
}

/// Calls an "upload" step then a "notify" step, recording each in metadata.
pub struct TwoStepJob {
    uploads: Arc<AtomicUsize>,
    notify: Script,
}

impl JobBody for TwoStepJob {
    fn class_name(&self) -> &'static str {
        TWO_STEP_JOB
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<(), JobError> {
        if !ctx.step_completed("upload") {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            ctx.record_step("upload")?;
        }
        if let Some(kind) = self.notify.next() {
            return Err(JobError::new(kind, "notify step failed"));
        }
        ctx.record_step("notify")?;
        Ok(())
    }

    fn retry_error_types(&self) -> &[FailureKind] {
        &[FailureKind::IO]
    }
}

pub fn register_scripted(registry: &mut JobRegistry, script: &Script, policy: &Policy) {
    let script = script.clone();
    let policy = policy.clone();
    registry.register(SCRIPTED_JOB, move |_job: &Job| {
        Ok(Box::new(ScriptedJob {
            script: script.clone(),
            policy: policy.clone(),
        }) as Box<dyn JobBody>)
    });
}

pub fn register_two_step(registry: &mut JobRegistry, uploads: &Arc<AtomicUsize>, notify: &Script) {
    let uploads = uploads.clone();
    let notify = notify.clone();
    registry.register(TWO_STEP_JOB, move |_job: &Job| {
        Ok(Box::new(TwoStepJob {
            uploads: uploads.clone(),
            notify: notify.clone(),
        }) as Box<dyn JobBody>)
    });
}

/// In-memory services wired to inspectable collaborators.
pub struct Harness {
    pub services: Services,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub publisher: Arc<MemoryPublisher>,
    pub mailer: Arc<MemoryMailer>,
    pub metrics: Arc<InMemoryMetrics>,
}

impl Harness {
    pub fn new(registry: JobRegistry) -> Self {
        Self::with_config(registry, RunnerConfig::default())
    }

    pub fn with_config(registry: JobRegistry, config: RunnerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(start_time());
        let publisher = Arc::new(MemoryPublisher::new());
        let mailer = Arc::new(MemoryMailer::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let services = Services::new(store.clone(), registry, config)
            .with_clock(Arc::new(clock.clone()))
            .with_publisher(publisher.clone())
            .with_mailer(mailer.clone())
            .with_metrics(metrics.clone());
        Self {
            services,
            store,
            clock,
            publisher,
            mailer,
            metrics,
        }
    }

    /// Harness running a single scripted job class.
    pub fn scripted(script: &Script, policy: &Policy) -> Self {
        let mut registry = JobRegistry::new();
        register_scripted(&mut registry, script, policy);
        Self::new(registry)
    }

    pub fn create(&self, job_type: &str) -> JobId {
        let job = self.services.create_job(NewJob::new(job_type)).unwrap();
        self.store.commit().unwrap();
        job.id
    }

    pub fn job(&self, id: JobId) -> Job {
        self.store.get(id).unwrap()
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(self.services.clone())
    }

    /// One scheduling pass over every ready job.
    pub fn run_pass(&self) -> JobRunner {
        let mut runner = self.runner();
        runner.run_ready().unwrap();
        runner
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}
