use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::record::{Job, JobId};

/// Immutable view of a job taken just before a commit, so post-commit work
/// can proceed without going back to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub task_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub lease_expires: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn capture(job: &Job, task_id: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            task_id: task_id.into(),
            scheduled_start: job.scheduled_start,
            lease_expires: job.lease_expires,
        }
    }

    /// The earliest moment the job may run: the later of `now`, its
    /// scheduled start, and any outstanding lease.
    pub fn eta(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut eta = now.max(self.scheduled_start);
        if let Some(expires) = self.lease_expires {
            eta = eta.max(expires);
        }
        eta
    }
}
