//! Persistence contract for job records.
//!
//! A [`JobStore`] owns the job rows and the lease primitive. Writes happen
//! inside an implicit "current transaction" that stays open until
//! [`JobStore::commit`] or [`JobStore::abort`] is called, mirroring how a
//! runner holds a row lock from lease acquisition until its next commit.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: process-local, used by tests and embedders
//! - [`SqliteStore`]: file-backed, shared by the pool driver and its workers
//!
//! # Commit hooks
//!
//! Before-commit hooks run while the transaction is still open and may read
//! the store. After-commit hooks receive whether the commit succeeded and
//! must not touch the store. Aborting discards pending hooks.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::job::{Job, JobId, NewJob};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type BeforeCommitHook = Box<dyn FnOnce(&dyn JobStore) -> Result<()> + Send>;
pub type AfterCommitHook = Box<dyn FnOnce(bool) + Send>;

pub trait JobStore: Send + Sync {
    fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job>;

    fn get(&self, id: JobId) -> Result<Job>;

    /// Ready jobs, earliest `scheduled_start` first.
    fn ready_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    fn all_jobs(&self) -> Result<Vec<Job>>;

    /// Atomically sets `lease_expires` if no valid lease exists and the job is
    /// not terminal. Fails with `LeaseHeld` otherwise.
    fn try_acquire_lease(&self, id: JobId, expires: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<Job>;

    fn save(&self, job: &Job) -> Result<()>;

    /// Puts RUNNING jobs whose lease lapsed back into WAITING.
    fn requeue_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    fn commit(&self) -> Result<()>;

    fn abort(&self) -> Result<()>;

    fn add_before_commit_hook(&self, hook: BeforeCommitHook);

    fn add_after_commit_hook(&self, hook: AfterCommitHook);
}

/// Hooks registered against the current transaction.
#[derive(Default)]
pub struct TransactionHooks {
    before: Mutex<Vec<BeforeCommitHook>>,
    after: Mutex<Vec<AfterCommitHook>>,
}

impl TransactionHooks {
    pub fn add_before(&self, hook: BeforeCommitHook) {
        self.before
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn add_after(&self, hook: AfterCommitHook) {
        self.after
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn clear(&self) {
        self.before.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.after.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Runs before-commit hooks, `commit`, then after-commit hooks.
    ///
    /// Hooks are taken out of their locks before running, so they may
    /// register further hooks or call back into the store.
    pub fn run_commit(
        &self,
        store: &dyn JobStore,
        commit: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let before = std::mem::take(&mut *self.before.lock().unwrap_or_else(|e| e.into_inner()));
        for hook in before {
            if let Err(e) = hook(store) {
                tracing::warn!(error = %e, "Before-commit hook failed, aborting transaction");
                self.clear();
                store.abort()?;
                return Err(e);
            }
        }

        let outcome = commit();
        let after = std::mem::take(&mut *self.after.lock().unwrap_or_else(|e| e.into_inner()));
        let succeeded = outcome.is_ok();
        for hook in after {
            hook(succeeded);
        }
        outcome
    }
}

impl std::fmt::Debug for TransactionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let before = self.before.lock().map(|h| h.len()).unwrap_or(0);
        let after = self.after.lock().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("TransactionHooks")
            .field("before", &before)
            .field("after", &after)
            .finish()
    }
}
