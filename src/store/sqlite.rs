use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::clock::{from_millis, to_millis};
use crate::error::{Result, RunnerError};
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::store::{AfterCommitHook, BeforeCommitHook, JobStore, TransactionHooks};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const JOB_COLUMNS: &str = "id, job_type, status, lease_expires_ms, scheduled_start_ms, \
     attempt_count, metadata_json, date_created_ms, date_started_ms, date_finished_ms";

/// File-backed job store. Each process opens its own connection; the lease
/// update is a single conditional `UPDATE`, so runners in different
/// processes exclude each other through the database.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    hooks: TransactionHooks,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            path,
            conn: Mutex::new(conn),
            hooks: TransactionHooks::default(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              job_type TEXT NOT NULL,
              status TEXT NOT NULL,
              lease_expires_ms INTEGER,
              scheduled_start_ms INTEGER NOT NULL,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              metadata_json TEXT NOT NULL DEFAULT '{}',
              date_created_ms INTEGER NOT NULL,
              date_started_ms INTEGER,
              date_finished_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS jobs_ready
              ON jobs(status, scheduled_start_ms);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens the implicit transaction on first write. `IMMEDIATE` takes the
    /// write lock up front so concurrent lease attempts serialize.
    fn begin_write(conn: &Connection) -> Result<()> {
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    fn load(conn: &Connection, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1");
        let row = conn
            .query_row(&sql, params![id], read_row)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }
}

impl JobStore for SqliteStore {
    fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let conn = self.conn();
        Self::begin_write(&conn)?;
        let scheduled_start = new_job.scheduled_start.unwrap_or(now);
        let metadata = serde_json::to_string(&new_job.metadata)?;
        conn.execute(
            "INSERT INTO jobs(job_type, status, scheduled_start_ms, attempt_count, metadata_json, date_created_ms) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                new_job.job_type,
                JobStatus::Waiting.as_str(),
                to_millis(scheduled_start),
                metadata,
                to_millis(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::load(&conn, id)?.ok_or(RunnerError::JobNotFound(id))
    }

    fn get(&self, id: JobId) -> Result<Job> {
        Self::load(&self.conn(), id)?.ok_or(RunnerError::JobNotFound(id))
    }

    fn ready_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status=?1 AND scheduled_start_ms <= ?2 \
               AND (lease_expires_ms IS NULL OR lease_expires_ms <= ?2) \
             ORDER BY scheduled_start_ms, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![JobStatus::Waiting.as_str(), to_millis(now)],
            read_row,
        )?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    fn all_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    fn try_acquire_lease(
        &self,
        id: JobId,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let conn = self.conn();
        Self::begin_write(&conn)?;
        let updated = conn.execute(
            "UPDATE jobs SET lease_expires_ms=?1 \
             WHERE id=?2 AND status IN (?3, ?4) \
               AND (lease_expires_ms IS NULL OR lease_expires_ms <= ?5)",
            params![
                to_millis(expires),
                id,
                JobStatus::Waiting.as_str(),
                JobStatus::Running.as_str(),
                to_millis(now),
            ],
        )?;
        match Self::load(&conn, id)? {
            None => Err(RunnerError::JobNotFound(id)),
            Some(_) if updated == 0 => Err(RunnerError::LeaseHeld(id)),
            Some(job) => Ok(job),
        }
    }

    fn save(&self, job: &Job) -> Result<()> {
        let conn = self.conn();
        Self::begin_write(&conn)?;
        let metadata = serde_json::to_string(&job.metadata)?;
        let updated = conn.execute(
            "UPDATE jobs SET status=?1, lease_expires_ms=?2, scheduled_start_ms=?3, \
               attempt_count=MAX(attempt_count, ?4), metadata_json=?5, \
               date_started_ms=?6, date_finished_ms=?7 \
             WHERE id=?8",
            params![
                job.status.as_str(),
                job.lease_expires.map(to_millis),
                to_millis(job.scheduled_start),
                job.attempt_count,
                metadata,
                job.date_started.map(to_millis),
                job.date_finished.map(to_millis),
                job.id,
            ],
        )?;
        if updated == 0 {
            return Err(RunnerError::JobNotFound(job.id));
        }
        Ok(())
    }

    fn requeue_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let conn = self.conn();
        Self::begin_write(&conn)?;
        let mut stmt = conn.prepare(
            "UPDATE jobs SET status=?1, lease_expires_ms=NULL \
             WHERE status=?2 AND (lease_expires_ms IS NULL OR lease_expires_ms <= ?3) \
             RETURNING id",
        )?;
        let rows = stmt.query_map(
            params![
                JobStatus::Waiting.as_str(),
                JobStatus::Running.as_str(),
                to_millis(now),
            ],
            |row| row.get::<_, JobId>(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn commit(&self) -> Result<()> {
        self.hooks.run_commit(self, || {
            let conn = self.conn();
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
            Ok(())
        })
    }

    fn abort(&self) -> Result<()> {
        self.hooks.clear();
        let conn = self.conn();
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn add_before_commit_hook(&self, hook: BeforeCommitHook) {
        self.hooks.add_before(hook);
    }

    fn add_after_commit_hook(&self, hook: AfterCommitHook) {
        self.hooks.add_after(hook);
    }
}

struct JobRow {
    id: JobId,
    job_type: String,
    status: String,
    lease_expires_ms: Option<i64>,
    scheduled_start_ms: i64,
    attempt_count: u32,
    metadata_json: String,
    date_created_ms: i64,
    date_started_ms: Option<i64>,
    date_finished_ms: Option<i64>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        job_type: row.get(1)?,
        status: row.get(2)?,
        lease_expires_ms: row.get(3)?,
        scheduled_start_ms: row.get(4)?,
        attempt_count: row.get(5)?,
        metadata_json: row.get(6)?,
        date_created_ms: row.get(7)?,
        date_started_ms: row.get(8)?,
        date_finished_ms: row.get(9)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            RunnerError::Internal(format!("job {} has unknown status {}", self.id, self.status))
        })?;
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata_json)?;
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            status,
            lease_expires: self.lease_expires_ms.map(from_millis),
            scheduled_start: from_millis(self.scheduled_start_ms),
            attempt_count: self.attempt_count,
            metadata,
            date_created: from_millis(self.date_created_ms),
            date_started: self.date_started_ms.map(from_millis),
            date_finished: self.date_finished_ms.map(from_millis),
        })
    }
}
