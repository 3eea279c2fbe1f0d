use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::job::{Job, JobId};
use crate::runnable::failure::JobError;
use crate::store::JobStore;

/// When a running job must give up, plus a token a supervisor can cancel to
/// make it give up early. Job bodies consult this instead of any global.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<DateTime<Utc>>,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Deadline {
    pub fn new(at: Option<DateTime<Utc>>, token: CancellationToken, clock: Arc<dyn Clock>) -> Self {
        Self { at, token, clock }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.at.is_some_and(|at| self.clock.now() >= at)
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        if self.token.is_cancelled() {
            return Some(Duration::ZERO);
        }
        self.at
            .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn check(&self) -> Result<(), JobError> {
        if self.is_expired() {
            Err(JobError::timeout("job exceeded its lease deadline"))
        } else {
            Ok(())
        }
    }
}

/// What a job body sees while it runs.
pub struct RunContext<'a> {
    job: &'a mut Job,
    store: &'a dyn JobStore,
    deadline: &'a Deadline,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(job: &'a mut Job, store: &'a dyn JobStore, deadline: &'a Deadline) -> Self {
        Self {
            job,
            store,
            deadline,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt_count(&self) -> u32 {
        self.job.attempt_count
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.job.metadata
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.job.metadata_str(key)
    }

    pub fn deadline(&self) -> &Deadline {
        self.deadline
    }

    pub fn check_deadline(&self) -> Result<(), JobError> {
        self.deadline.check()
    }

    pub fn step_completed(&self, step: &str) -> bool {
        self.job.step_completed(step)
    }

    /// Records `step` as done and commits it, so a retry after a later
    /// failure skips it.
    pub fn record_step(&mut self, step: &str) -> Result<(), JobError> {
        self.job.mark_step_completed(step);
        self.persist_metadata()
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.job.metadata.insert(key.into(), value.into());
    }

    /// Saves and commits the job's metadata.
    pub fn persist_metadata(&mut self) -> Result<(), JobError> {
        self.store.save(self.job)?;
        self.store.commit()?;
        Ok(())
    }
}
