//! Hands jobs to an external task queue instead of running them locally.
//!
//! Delegation is decided per job class by the [`DELEGATION_FLAG`] feature
//! flag. The submission is wired into the store's commit: a before-commit
//! hook captures a [`JobState`] snapshot and an after-commit hook submits it,
//! only when the commit succeeded.

use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::config::DelegationConfig;
use crate::job::JobState;
use crate::runnable::RunnableJob;
use crate::store::JobStore;

pub mod flags;
pub mod task_queue;

pub use flags::{FeatureFlags, DELEGATION_FLAG};
pub use task_queue::{MemoryTaskQueue, SpoolTaskQueue, TaskQueue, TaskSubmission};

pub struct Delegator {
    flags: FeatureFlags,
    queue: Arc<dyn TaskQueue>,
    config: DelegationConfig,
    dbuser: String,
    clock: Arc<dyn Clock>,
}

impl Delegator {
    pub fn new(
        flags: FeatureFlags,
        queue: Arc<dyn TaskQueue>,
        config: DelegationConfig,
        dbuser: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            flags,
            queue,
            config,
            dbuser: dbuser.into(),
            clock,
        }
    }

    pub fn enabled_for(&self, class_name: &str) -> bool {
        self.flags.delegated_classes().contains(&class_name)
    }

    /// Registers commit hooks that submit `job` to the task queue. Returns
    /// `false` without registering anything when its class is not delegated.
    pub fn run_on_commit(&self, job: &RunnableJob, store: &dyn JobStore) -> bool {
        let class_name = job.class_name();
        if !self.enabled_for(class_name) {
            return false;
        }
        let job_id = job.id();
        let task_id = format!("{}_{}_{}", class_name, job_id, uuid::Uuid::new_v4());
        let captured: Arc<Mutex<Option<JobState>>> = Arc::new(Mutex::new(None));

        let slot = captured.clone();
        store.add_before_commit_hook(Box::new(move |store: &dyn JobStore| {
            let job = store.get(job_id)?;
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(JobState::capture(&job, task_id));
            Ok(())
        }));

        let queue = self.queue.clone();
        let clock = self.clock.clone();
        let module = job.module_name().to_string();
        let class_name = class_name.to_string();
        let dbuser = self.dbuser.clone();
        let queue_name = self.config.task_queue.clone();
        let soft_time_limit = self.config.soft_time_limit.as_secs_f64();
        store.add_after_commit_hook(Box::new(move |committed| {
            if !committed {
                return;
            }
            let Some(state) = captured.lock().unwrap_or_else(|e| e.into_inner()).take() else {
                return;
            };
            let task = TaskSubmission {
                job_id: state.job_id,
                module,
                class_name,
                dbuser,
                queue: queue_name,
                eta: state.eta(clock.now()),
                soft_time_limit,
                task_id: state.task_id,
            };
            match queue.submit(&task) {
                Ok(()) => tracing::info!(job_id = task.job_id, task_id = %task.task_id, "Delegated job"),
                Err(e) => tracing::error!(job_id = task.job_id, error = %e, "Failed to delegate job"),
            }
        }));
        true
    }
}

impl std::fmt::Debug for Delegator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegator")
            .field("classes", &self.flags.delegated_classes())
            .field("config", &self.config)
            .finish()
    }
}
