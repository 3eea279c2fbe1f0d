//! Job bodies shipped with the runner.

use crate::job::Job;
use crate::registry::JobRegistry;
use crate::runnable::JobBody;

pub mod shell;

pub use shell::{ShellJob, SHELL_JOB};

pub fn register_builtin(registry: &mut JobRegistry) {
    registry.register(SHELL_JOB, |job: &Job| {
        Ok(Box::new(ShellJob::from_job(job)?) as Box<dyn JobBody>)
    });
}

pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry);
    registry
}
