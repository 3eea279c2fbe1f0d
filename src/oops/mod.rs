//! OOPS reports: structured, uniquely identified records of failures that
//! operators need to look at.
//!
//! [`ErrorReporter::raising`] turns a [`JobError`] plus context into an
//! [`OopsReport`] and hands it to the configured [`OopsPublisher`]. A
//! publishing failure is logged and never replaces the original failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::runnable::JobError;

pub mod publisher;

pub use publisher::{DirectoryPublisher, LogPublisher, MemoryPublisher, OopsPublisher};

/// Context attached to an OOPS besides the failure itself.
#[derive(Debug, Clone, Default)]
pub struct OopsContext {
    pub operation: Option<String>,
    pub vars: BTreeMap<String, String>,
}

impl OopsContext {
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OopsReport {
    pub id: String,
    /// Failure kind name, e.g. `TimeoutError`
    pub kind: String,
    pub value: String,
    /// Messages of the failure and its sources, outermost first
    pub chain: Vec<String>,
    pub time: DateTime<Utc>,
    pub reporter: String,
    pub operation: Option<String>,
    pub vars: BTreeMap<String, String>,
}

pub fn new_oops_id() -> String {
    format!("OOPS-{}", uuid::Uuid::new_v4().simple())
}

pub struct ErrorReporter {
    reporter: String,
    publisher: Arc<dyn OopsPublisher>,
    clock: Arc<dyn Clock>,
}

impl ErrorReporter {
    pub fn new(
        reporter: impl Into<String>,
        publisher: Arc<dyn OopsPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reporter: reporter.into(),
            publisher,
            clock,
        }
    }

    pub fn publisher(&self) -> &Arc<dyn OopsPublisher> {
        &self.publisher
    }

    /// Builds, publishes and returns an OOPS for `err`.
    pub fn raising(&self, err: &JobError, context: OopsContext) -> OopsReport {
        let report = OopsReport {
            id: new_oops_id(),
            kind: err.kind().name().to_string(),
            value: err.message().to_string(),
            chain: err.chain(),
            time: self.clock.now(),
            reporter: self.reporter.clone(),
            operation: context.operation,
            vars: context.vars,
        };
        if let Err(e) = self.publisher.publish(&report) {
            tracing::error!(oops_id = %report.id, error = %e, "Failed to publish OOPS");
        }
        report
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("reporter", &self.reporter)
            .finish()
    }
}
