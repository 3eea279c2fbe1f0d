use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Lease held on job {0}")]
    LeaseHeld(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job store at capacity")]
    StoreFull,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// A held lease is a routine "try again later" outcome, not a failure.
    pub fn is_lease_held(&self) -> bool {
        matches!(self, RunnerError::LeaseHeld(_))
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
