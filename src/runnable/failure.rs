use std::error::Error as StdError;
use std::fmt;

use crate::error::RunnerError;

/// Names the category of a job failure, the way an exception type would.
/// Job classes list the kinds they treat as user errors or as retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailureKind(&'static str);

impl FailureKind {
    pub const TIMEOUT: FailureKind = FailureKind("TimeoutError");
    pub const IO: FailureKind = FailureKind("IOError");
    pub const STORE: FailureKind = FailureKind("StoreError");
    pub const INTERNAL: FailureKind = FailureKind("InternalError");
    pub const WORKER_EXITED: FailureKind = FailureKind("WorkerExited");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// How the runner reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The requester's fault: fail the job and tell the user.
    User,
    /// Transient: requeue with backoff.
    Retry,
    /// Anything else: fail the job and file an OOPS.
    Unclassified,
}

/// A failure raised by a job body.
#[derive(Debug)]
pub struct JobError {
    kind: FailureKind,
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: FailureKind,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TIMEOUT, message)
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is(&self, kind: FailureKind) -> bool {
        self.kind == kind
    }

    /// Messages of this error and every source below it, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = StdError::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for JobError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}

impl From<RunnerError> for JobError {
    fn from(err: RunnerError) -> Self {
        let kind = match err {
            RunnerError::Io(_) => FailureKind::IO,
            RunnerError::Database(_) | RunnerError::JobNotFound(_) | RunnerError::LeaseHeld(_) => {
                FailureKind::STORE
            }
            _ => FailureKind::INTERNAL,
        };
        let message = err.to_string();
        JobError::with_source(kind, message, err)
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        let message = err.to_string();
        JobError::with_source(FailureKind::IO, message, err)
    }
}
