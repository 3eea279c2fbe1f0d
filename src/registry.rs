//! Maps `job_type` strings to factories that build job bodies.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RunnerError};
use crate::job::Job;
use crate::runnable::JobBody;

pub type JobFactory = Arc<dyn Fn(&Job) -> Result<Box<dyn JobBody>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `job_type`, replacing any previous entry.
    pub fn register<F>(&mut self, job_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Job) -> Result<Box<dyn JobBody>> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn build(&self, job: &Job) -> Result<Box<dyn JobBody>> {
        let factory = self
            .factories
            .get(&job.job_type)
            .ok_or_else(|| RunnerError::UnknownJobType(job.job_type.clone()))?;
        factory(job)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
