use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the subprocess worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently running worker processes
    pub max_workers: usize,
    /// How long a worker may take to unwind after its deadline before it
    /// exits with the timeout code
    pub timeout_grace: Duration,
    /// How long to wait for a worker to exit after closing its stdin
    pub stop_timeout: Duration,
    /// Program started for each worker
    pub worker_program: PathBuf,
    /// Arguments passed to the worker program
    pub worker_args: Vec<String>,
    /// Address-space limit applied inside each worker (bytes)
    pub memory_limit_bytes: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            timeout_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            worker_program: PathBuf::from("job-runner"),
            worker_args: vec!["worker".to_string()],
            memory_limit_bytes: None,
        }
    }
}

impl PoolConfig {
    pub fn with_worker(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.worker_program = program.into();
        self.worker_args = args;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }
}

/// Where OOPS reports go.
#[derive(Debug, Clone)]
pub struct OopsConfig {
    /// Name recorded as the reporter of every OOPS
    pub reporter: String,
    /// Directory for JSON reports. When unset, reports are only logged.
    pub publish_dir: Option<PathBuf>,
}

impl Default for OopsConfig {
    fn default() -> Self {
        Self {
            reporter: "job-runner".to_string(),
            publish_dir: None,
        }
    }
}

/// Settings for handing jobs to an external task queue.
#[derive(Debug, Clone)]
pub struct DelegationConfig {
    /// Queue name tasks are submitted to
    pub task_queue: String,
    /// Soft time limit attached to each task
    pub soft_time_limit: Duration,
    /// Spool directory for submitted tasks. When unset, delegation is off.
    pub spool_dir: Option<PathBuf>,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            task_queue: "job_runner".to_string(),
            soft_time_limit: Duration::from_secs(5 * 60),
            spool_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Default lease taken before running a job
    pub lease_duration: Duration,
    /// Database identity handed to delegated tasks
    pub dbuser: String,
    /// Sender of notification mail
    pub from_address: String,
    /// Suppress outbound mail
    pub dry_run: bool,
    pub pool: PoolConfig,
    pub oops: OopsConfig,
    pub delegation: DelegationConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5 * 60),
            dbuser: "job_runner".to_string(),
            from_address: "noreply@localhost".to_string(),
            dry_run: false,
            pool: PoolConfig::default(),
            oops: OopsConfig::default(),
            delegation: DelegationConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_dbuser(mut self, dbuser: impl Into<String>) -> Self {
        self.dbuser = dbuser.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_default() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.max_workers, 1);
        assert_eq!(cfg.timeout_grace, Duration::from_secs(1));
        assert_eq!(cfg.worker_args, vec!["worker".to_string()]);
        assert!(cfg.memory_limit_bytes.is_none());
    }

    #[test]
    fn pool_config_never_drops_below_one_worker() {
        let cfg = PoolConfig::default().with_max_workers(0);
        assert_eq!(cfg.max_workers, 1);
    }

    #[test]
    fn pool_config_with_worker() {
        let cfg = PoolConfig::default()
            .with_worker("/usr/bin/job-runner", vec!["worker".into(), "--database".into()]);
        assert_eq!(cfg.worker_program, PathBuf::from("/usr/bin/job-runner"));
        assert_eq!(cfg.worker_args.len(), 2);
    }

    #[test]
    fn runner_config_default() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.lease_duration, Duration::from_secs(300));
        assert_eq!(cfg.dbuser, "job_runner");
        assert!(!cfg.dry_run);
        assert!(cfg.oops.publish_dir.is_none());
        assert_eq!(cfg.delegation.task_queue, "job_runner");
        assert_eq!(cfg.delegation.soft_time_limit, Duration::from_secs(300));
    }

    #[test]
    fn runner_config_builders() {
        let cfg = RunnerConfig::default()
            .with_lease_duration(Duration::from_secs(30))
            .with_dbuser("uploader")
            .with_pool(PoolConfig::default().with_max_workers(4));
        assert_eq!(cfg.lease_duration, Duration::from_secs(30));
        assert_eq!(cfg.dbuser, "uploader");
        assert_eq!(cfg.pool.max_workers, 4);
    }
}
