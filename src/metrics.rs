//! Counters emitted on job lifecycle transitions, keyed by job class.

use std::collections::HashMap;
use std::sync::Mutex;

pub const JOB_START: &str = "job.start";
pub const JOB_COMPLETE: &str = "job.complete";
pub const JOB_FAIL: &str = "job.fail";
pub const JOB_QUEUE: &str = "job.queue";

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, job_type: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn increment(&self, _name: &str, _job_type: &str) {}
}

/// Emits each counter as a debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn increment(&self, name: &str, job_type: &str) {
        tracing::debug!(counter = name, job_type, "metric");
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counts: Mutex<HashMap<(String, String), u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str, job_type: &str) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(name.to_string(), job_type.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, job_type: &str) {
        *self
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((name.to_string(), job_type.to_string()))
            .or_insert(0) += 1;
    }
}
