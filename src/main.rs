use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use job_runner::config::{PoolConfig, RunnerConfig};
use job_runner::delegation::{Delegator, FeatureFlags, SpoolTaskQueue};
use job_runner::job::{Job, JobStatus, NewJob};
use job_runner::jobs::{builtin_registry, SHELL_JOB};
use job_runner::metrics::LogMetrics;
use job_runner::notify::{LogMailer, SendmailMailer};
use job_runner::runner::{JobRunner, PoolRunner};
use job_runner::services::Services;
use job_runner::shutdown::install_shutdown_handler;
use job_runner::store::{JobStore, SqliteStore};
use job_runner::worker::{self, WorkerEnvironment};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "job-runner")]
#[command(version)]
#[command(about = "Runs persisted jobs under leases, in-process or in worker subprocesses")]
#[command(propagate_version = true)]
struct Args {
    /// SQLite database holding the jobs
    #[arg(long, global = true, default_value = "job-runner.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run ready jobs one at a time in this process
    Run(RunnerArgs),

    /// Run ready jobs in worker subprocesses
    Pool(PoolArgs),

    /// Serve jobs for a pool driver over stdin/stdout (internal)
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Runner Arguments
// =============================================================================

#[derive(Parser, Debug, Clone)]
struct RunnerArgs {
    /// Lease taken on each job before running it
    #[arg(long, default_value = "300")]
    lease_secs: u64,

    /// Log notification mail instead of sending it
    #[arg(long)]
    dry_run: bool,

    /// Sender address for notification mail
    #[arg(long, default_value = "noreply@localhost")]
    from_address: String,

    /// Write OOPS reports as JSON files into this directory
    #[arg(long)]
    oops_dir: Option<PathBuf>,

    /// Spool directory for jobs delegated to the task queue
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Feature flag assignment, e.g. "jobs.delegation.enabled_classes=ShellJob"
    #[arg(long = "flag", value_name = "NAME=VALUE")]
    flags: Vec<String>,
}

#[derive(Parser, Debug)]
struct PoolArgs {
    #[command(flatten)]
    runner: RunnerArgs,

    /// Maximum concurrent worker processes
    #[arg(long, default_value = "1")]
    max_workers: usize,

    /// Time a worker gets to unwind after its deadline, in milliseconds
    #[arg(long, default_value = "1000")]
    grace_ms: u64,

    /// Address-space limit for each worker, in bytes
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Keep polling for ready jobs until SIGTERM or SIGINT
    #[arg(long = "loop")]
    run_forever: bool,

    /// Seconds between polls with --loop
    #[arg(long, default_value = "5")]
    interval_secs: u64,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    runner: RunnerArgs,

    /// Time a job gets to unwind after its deadline, in milliseconds
    #[arg(long, default_value = "1000")]
    grace_ms: u64,

    /// Address-space limit for this process, in bytes
    #[arg(long)]
    memory_limit: Option<u64>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a shell job
    Submit {
        /// The command to execute (e.g., "echo hello")
        command: String,

        /// Operation description used in notifications
        #[arg(long)]
        description: Option<String>,

        /// Give up retrying after this many attempts
        #[arg(long)]
        max_retries: Option<u32>,

        /// Delay before a retry, in seconds
        #[arg(long)]
        retry_delay_secs: Option<u64>,

        /// Do not run before this many seconds from now
        #[arg(long)]
        delay_secs: Option<u64>,

        /// Address told about user errors
        #[arg(long = "error-recipient")]
        error_recipients: Vec<String>,

        /// Address told about OOPSes
        #[arg(long = "oops-recipient")]
        oops_recipients: Vec<String>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID
        job_id: i64,
    },
    /// List all jobs
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: i64,
    scheduled_start: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: i64,
    job_type: String,
    status: String,
    attempt_count: u32,
    scheduled_start: String,
    lease_expires: Option<String>,
    date_created: String,
    date_started: Option<String>,
    date_finished: Option<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<&Job> for JobStatusOutput {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            status: job.status.to_string(),
            attempt_count: job.attempt_count,
            scheduled_start: job.scheduled_start.to_rfc3339(),
            lease_expires: job.lease_expires.map(|t| t.to_rfc3339()),
            date_created: job.date_created.to_rfc3339(),
            date_started: job.date_started.map(|t| t.to_rfc3339()),
            date_finished: job.date_finished.map(|t| t.to_rfc3339()),
            metadata: job.metadata.clone(),
        }
    }
}

#[derive(Serialize)]
struct JobListItem {
    job_id: i64,
    job_type: String,
    status: String,
    attempt_count: u32,
    scheduled_start: String,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    // stdout carries worker frames and command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn runner_config(args: &RunnerArgs) -> RunnerConfig {
    let mut config =
        RunnerConfig::default().with_lease_duration(Duration::from_secs(args.lease_secs));
    config.dry_run = args.dry_run;
    config.from_address = args.from_address.clone();
    config.oops.publish_dir = args.oops_dir.clone();
    config.delegation.spool_dir = args.spool_dir.clone();
    config
}

fn build_services(
    database: &Path,
    config: RunnerConfig,
    flags: &[String],
) -> CliResult<Services> {
    let store = Arc::new(SqliteStore::open(database)?);
    let dry_run = config.dry_run;
    let mut services = Services::new(store, builtin_registry(), config)
        .with_configured_publisher()?
        .with_metrics(Arc::new(LogMetrics));
    services = if dry_run {
        services.with_mailer(Arc::new(LogMailer))
    } else {
        services.with_mailer(Arc::new(SendmailMailer::default()))
    };

    if let Some(dir) = services.config.delegation.spool_dir.clone() {
        let delegator = Delegator::new(
            FeatureFlags::from_assignments(flags)?,
            Arc::new(SpoolTaskQueue::new(dir)?),
            services.config.delegation.clone(),
            services.config.dbuser.clone(),
            services.clock.clone(),
        );
        services = services.with_delegator(Arc::new(delegator));
    }
    Ok(services)
}

/// Arguments that make a worker child see the same store and settings.
fn worker_args(database: &Path, args: &PoolArgs) -> Vec<String> {
    let runner = &args.runner;
    let mut worker_args = vec![
        "--database".to_string(),
        database.display().to_string(),
        "worker".to_string(),
        format!("--grace-ms={}", args.grace_ms),
        format!("--lease-secs={}", runner.lease_secs),
        format!("--from-address={}", runner.from_address),
    ];
    if runner.dry_run {
        worker_args.push("--dry-run".to_string());
    }
    if let Some(dir) = &runner.oops_dir {
        worker_args.push(format!("--oops-dir={}", dir.display()));
    }
    if let Some(dir) = &runner.spool_dir {
        worker_args.push(format!("--spool-dir={}", dir.display()));
    }
    for flag in &runner.flags {
        worker_args.push(format!("--flag={flag}"));
    }
    worker_args
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// =============================================================================
// Command Implementations
// =============================================================================

fn run_sync(database: &Path, args: RunnerArgs) -> CliResult<()> {
    let services = build_services(database, runner_config(&args), &args.flags)?;
    let mut runner = JobRunner::new(services);
    runner.run_ready()?;
    runner.log_summary();
    Ok(())
}

async fn run_pool(database: &Path, args: PoolArgs) -> CliResult<()> {
    let pool = PoolConfig {
        memory_limit_bytes: args.memory_limit,
        ..PoolConfig::default()
    }
    .with_worker(std::env::current_exe()?, worker_args(database, &args))
    .with_max_workers(args.max_workers)
    .with_timeout_grace(Duration::from_millis(args.grace_ms));
    let config = runner_config(&args.runner).with_pool(pool);
    let services = build_services(database, config, &args.runner.flags)?;

    let mut runner = PoolRunner::new(services);
    if args.run_forever {
        let shutdown = install_shutdown_handler()?;
        runner
            .run_loop(Duration::from_secs(args.interval_secs), shutdown)
            .await?;
    } else {
        let result = runner.run_ready().await;
        runner.shutdown().await;
        result?;
    }
    runner.log_summary();
    Ok(())
}

async fn run_worker(database: &Path, args: WorkerArgs) -> CliResult<()> {
    let _environment = WorkerEnvironment::enter(args.memory_limit)?;
    let services = build_services(database, runner_config(&args.runner), &args.runner.flags)?;
    worker::serve(
        services,
        Duration::from_millis(args.grace_ms),
        tokio::io::stdin(),
        tokio::io::stdout(),
        worker::process_exit(),
    )
    .await?;
    Ok(())
}

fn handle_job_command(
    database: &Path,
    command: JobCommands,
    output: &OutputFormat,
) -> CliResult<()> {
    let store = SqliteStore::open(database)?;

    match command {
        JobCommands::Submit {
            command,
            description,
            max_retries,
            retry_delay_secs,
            delay_secs,
            error_recipients,
            oops_recipients,
        } => {
            let now = chrono::Utc::now();
            let mut new_job = NewJob::new(SHELL_JOB).with_metadata("command", command);
            if let Some(description) = description {
                new_job = new_job.with_metadata("description", description);
            }
            if let Some(max_retries) = max_retries {
                new_job = new_job.with_metadata("max_retries", max_retries);
            }
            if let Some(secs) = retry_delay_secs {
                new_job = new_job.with_metadata("retry_delay_secs", secs);
            }
            if !error_recipients.is_empty() {
                new_job = new_job.with_metadata("error_recipients", error_recipients);
            }
            if !oops_recipients.is_empty() {
                new_job = new_job.with_metadata("oops_recipients", oops_recipients);
            }
            if let Some(secs) = delay_secs {
                let delay = chrono::Duration::seconds(i64::try_from(secs)?);
                new_job = new_job.scheduled_at(now + delay);
            }

            let job = store.create(new_job, now)?;
            store.commit()?;

            match output {
                OutputFormat::Json => {
                    let output = JobSubmitOutput {
                        job_id: job.id,
                        scheduled_start: job.scheduled_start.to_rfc3339(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", job.id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = store.get(job_id)?;
            match output {
                OutputFormat::Json => {
                    let output = JobStatusOutput::from(&job);
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job ID:          {}", job.id);
                    println!("Type:            {}", job.job_type);
                    println!("Status:          {}", job.status);
                    println!("Attempts:        {}", job.attempt_count);
                    println!("Scheduled Start: {}", format_time(Some(job.scheduled_start)));
                    if job.status == JobStatus::Running {
                        println!("Lease Expires:   {}", format_time(job.lease_expires));
                    }
                    println!("Started:         {}", format_time(job.date_started));
                    println!("Finished:        {}", format_time(job.date_finished));
                    if let Some(output) = job.metadata_str("output") {
                        println!("Output:");
                        for line in output.lines() {
                            println!("  {}", line);
                        }
                    }
                    if let Some(stderr) = job.metadata_str("stderr") {
                        println!("Error:");
                        for line in stderr.lines() {
                            println!("  {}", line);
                        }
                    }
                }
            }
        }
        JobCommands::List => {
            let mut jobs = store.all_jobs()?;
            jobs.sort_by_key(|job| job.id);
            match output {
                OutputFormat::Json => {
                    let output = JobListOutput {
                        total_count: jobs.len(),
                        jobs: jobs
                            .iter()
                            .map(|job| JobListItem {
                                job_id: job.id,
                                job_type: job.job_type.clone(),
                                status: job.status.to_string(),
                                attempt_count: job.attempt_count,
                                scheduled_start: job.scheduled_start.to_rfc3339(),
                            })
                            .collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                        return Ok(());
                    }
                    println!(
                        "{:<8} {:<12} {:<10} {:<9} COMMAND",
                        "JOB ID", "TYPE", "STATUS", "ATTEMPTS"
                    );
                    println!("{}", "-".repeat(78));
                    for job in &jobs {
                        let command = job.metadata_str("command").unwrap_or("-");
                        let command = if command.len() > 36 {
                            let cut = (0..=33)
                                .rev()
                                .find(|&i| command.is_char_boundary(i))
                                .unwrap_or(0);
                            format!("{}...", &command[..cut])
                        } else {
                            command.to_string()
                        };
                        println!(
                            "{:<8} {:<12} {:<10} {:<9} {}",
                            job.id, job.job_type, job.status, job.attempt_count, command
                        );
                    }
                    println!();
                    println!("Showing {} jobs", jobs.len());
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult<()> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Run(runner_args) => {
            // Job bodies block on the runtime handle, which is not allowed on
            // the runtime's own thread.
            let database = args.database.clone();
            tokio::task::spawn_blocking(move || run_sync(&database, runner_args)).await??;
        }
        Commands::Pool(pool_args) => {
            run_pool(&args.database, pool_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(&args.database, worker_args).await?;
        }
        Commands::Job { output, command } => {
            handle_job_command(&args.database, command, &output)?;
        }
    }

    Ok(())
}
