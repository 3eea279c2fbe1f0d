use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{Result, RunnerError};
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::store::{AfterCommitHook, BeforeCommitHook, JobStore, TransactionHooks};

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, Job>,
    last_id: JobId,
    commits: u64,
}

/// Process-local job store.
///
/// Writes are visible immediately; `abort` only discards pending commit
/// hooks, it cannot roll rows back.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    max_jobs: usize,
    hooks: TransactionHooks,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_jobs,
            hooks: TransactionHooks::default(),
        }
    }

    /// Number of successful commits, for asserting transaction boundaries.
    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobStore for MemoryStore {
    fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let mut state = self.lock();
        if state.jobs.len() >= self.max_jobs {
            return Err(RunnerError::StoreFull);
        }
        state.last_id += 1;
        let job = Job::from_new(state.last_id, new_job, now);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(RunnerError::JobNotFound(id))
    }

    fn ready_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut ready: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|job| (job.scheduled_start, job.id));
        Ok(ready)
    }

    fn all_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.lock().jobs.values().cloned().collect())
    }

    fn try_acquire_lease(
        &self,
        id: JobId,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id).ok_or(RunnerError::JobNotFound(id))?;
        if !job.can_lease(now) {
            return Err(RunnerError::LeaseHeld(id));
        }
        job.lease_expires = Some(expires);
        Ok(job.clone())
    }

    fn save(&self, job: &Job) -> Result<()> {
        let mut state = self.lock();
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or(RunnerError::JobNotFound(job.id))?;
        let attempt_count = stored.attempt_count.max(job.attempt_count);
        *stored = job.clone();
        stored.attempt_count = attempt_count;
        Ok(())
    }

    fn requeue_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut state = self.lock();
        let mut requeued = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running && !job.has_valid_lease(now) {
                job.status = JobStatus::Waiting;
                job.lease_expires = None;
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }

    fn commit(&self) -> Result<()> {
        self.hooks.run_commit(self, || {
            self.lock().commits += 1;
            Ok(())
        })
    }

    fn abort(&self) -> Result<()> {
        self.hooks.clear();
        Ok(())
    }

    fn add_before_commit_hook(&self, hook: BeforeCommitHook) {
        self.hooks.add_before(hook);
    }

    fn add_after_commit_hook(&self, hook: AfterCommitHook) {
        self.hooks.add_after(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn ready_jobs_are_ordered_by_schedule() {
        let store = MemoryStore::new();
        let late = store
            .create(NewJob::new("A").scheduled_at(at(20)), at(0))
            .unwrap();
        let early = store
            .create(NewJob::new("B").scheduled_at(at(10)), at(0))
            .unwrap();
        store
            .create(NewJob::new("C").scheduled_at(at(500)), at(0))
            .unwrap();

        let ready: Vec<JobId> = store
            .ready_jobs(at(100))
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ready, vec![early.id, late.id]);
    }

    #[test]
    fn second_lease_is_refused_until_expiry() {
        let store = MemoryStore::new();
        let job = store.create(NewJob::new("A"), at(0)).unwrap();

        store.try_acquire_lease(job.id, at(60), at(0)).unwrap();
        let err = store.try_acquire_lease(job.id, at(90), at(30)).unwrap_err();
        assert!(err.is_lease_held());

        let leased = store.try_acquire_lease(job.id, at(120), at(60)).unwrap();
        assert_eq!(leased.lease_expires, Some(at(120)));
    }

    #[test]
    fn capacity_is_enforced() {
        let store = MemoryStore::with_capacity(1);
        store.create(NewJob::new("A"), at(0)).unwrap();
        assert!(matches!(
            store.create(NewJob::new("A"), at(0)),
            Err(RunnerError::StoreFull)
        ));
    }

    #[test]
    fn abort_discards_after_commit_hooks() {
        let store = MemoryStore::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        store.add_after_commit_hook(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        store.abort().unwrap();
        store.commit().unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn requeue_expired_resets_orphaned_running_jobs() {
        let store = MemoryStore::new();
        let mut job = store.create(NewJob::new("A"), at(0)).unwrap();
        job = store.try_acquire_lease(job.id, at(10), at(0)).unwrap();
        job.start(at(1)).unwrap();
        store.save(&job).unwrap();

        assert!(store.requeue_expired(at(5)).unwrap().is_empty());
        assert_eq!(store.requeue_expired(at(11)).unwrap(), vec![job.id]);

        let job = store.get(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempt_count, 1);
    }
}
