use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RunnerError};

pub type JobId = i64;

/// Metadata key holding the names of sub-steps a job body has finished.
pub const COMPLETED_STEPS_KEY: &str = "completed_steps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(JobStatus::Waiting),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job waiting to be inserted into a store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub metadata: Map<String, Value>,
    pub scheduled_start: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            metadata: Map::new(),
            scheduled_start: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn scheduled_at(mut self, start: DateTime<Utc>) -> Self {
        self.scheduled_start = Some(start);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub lease_expires: Option<DateTime<Utc>>,
    pub scheduled_start: DateTime<Utc>,
    pub attempt_count: u32,
    pub metadata: Map<String, Value>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_new(id: JobId, new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new_job.job_type,
            status: JobStatus::Waiting,
            lease_expires: None,
            scheduled_start: new_job.scheduled_start.unwrap_or(now),
            attempt_count: 0,
            metadata: new_job.metadata,
            date_created: now,
            date_started: None,
            date_finished: None,
        }
    }

    /// Waiting, due, and not leased by anyone.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting
            && self.scheduled_start <= now
            && !self.has_valid_lease(now)
    }

    pub fn has_valid_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires.is_some_and(|expires| expires > now)
    }

    /// Whether a runner may take a lease on this job at `now`.
    pub fn can_lease(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && !self.has_valid_lease(now)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(self.status == JobStatus::Waiting, JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.attempt_count += 1;
        self.date_started = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(self.status == JobStatus::Running, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.lease_expires = None;
        self.date_finished = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(!self.status.is_terminal(), JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.lease_expires = None;
        self.date_finished = Some(now);
        Ok(())
    }

    /// Returns the job to WAITING. `scheduled_start` never moves backwards.
    pub fn queue(&mut self, scheduled_start: Option<DateTime<Utc>>) -> Result<()> {
        self.ensure(!self.status.is_terminal(), JobStatus::Waiting)?;
        self.status = JobStatus::Waiting;
        self.lease_expires = None;
        if let Some(start) = scheduled_start {
            self.scheduled_start = self.scheduled_start.max(start);
        }
        Ok(())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn step_completed(&self, step: &str) -> bool {
        self.metadata
            .get(COMPLETED_STEPS_KEY)
            .and_then(Value::as_array)
            .is_some_and(|steps| steps.iter().any(|s| s.as_str() == Some(step)))
    }

    pub fn mark_step_completed(&mut self, step: &str) {
        if self.step_completed(step) {
            return;
        }
        let steps = self
            .metadata
            .entry(COMPLETED_STEPS_KEY)
            .or_insert_with(|| Value::Array(Vec::new()));
        match steps {
            Value::Array(items) => items.push(Value::String(step.to_string())),
            other => *other = Value::Array(vec![Value::String(step.to_string())]),
        }
    }

    fn ensure(&self, allowed: bool, to: JobStatus) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(RunnerError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn waiting_job() -> Job {
        Job::from_new(1, NewJob::new("ShellJob"), at(0))
    }

    #[test]
    fn lifecycle_transitions() {
        let mut job = waiting_job();
        assert!(job.is_ready(at(0)));

        job.start(at(1)).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);

        job.complete(at(2)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.lease_expires.is_none());
        assert_eq!(job.date_finished, Some(at(2)));
    }

    #[test]
    fn terminal_jobs_reject_transitions() {
        let mut job = waiting_job();
        job.start(at(1)).unwrap();
        job.fail(at(2)).unwrap();

        assert!(matches!(
            job.queue(None),
            Err(RunnerError::InvalidTransition { .. })
        ));
        assert!(job.start(at(3)).is_err());
        assert!(!job.can_lease(at(3)));
    }

    #[test]
    fn queue_never_moves_schedule_backwards() {
        let mut job = waiting_job();
        job.scheduled_start = at(100);
        job.queue(Some(at(50))).unwrap();
        assert_eq!(job.scheduled_start, at(100));

        job.queue(Some(at(200))).unwrap();
        assert_eq!(job.scheduled_start, at(200));
    }

    #[test]
    fn lease_validity_depends_on_expiry() {
        let mut job = waiting_job();
        job.lease_expires = Some(at(10));
        assert!(job.has_valid_lease(at(5)));
        assert!(!job.is_ready(at(5)));
        assert!(!job.has_valid_lease(at(10)));
        assert!(job.can_lease(at(10)));
    }

    #[test]
    fn completed_steps_are_recorded_once() {
        let mut job = waiting_job();
        assert!(!job.step_completed("upload"));
        job.mark_step_completed("upload");
        job.mark_step_completed("upload");
        assert!(job.step_completed("upload"));
        assert_eq!(
            job.metadata[COMPLETED_STEPS_KEY],
            serde_json::json!(["upload"])
        );
    }

    #[test]
    fn status_parses_its_own_names() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("PENDING"), None);
    }
}
