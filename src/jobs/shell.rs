use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::Job;
use crate::process_group::ProcessGroup;
use crate::runnable::{BackoffPolicy, FailureKind, FixedBackoff, JobBody, JobError, RunContext};

pub const SHELL_JOB: &str = "ShellJob";

/// `EX_TEMPFAIL`: the command asks to be retried later.
pub const TEMP_FAIL: FailureKind = FailureKind::new("TempFail");
/// `EX_USAGE`: the command was invoked wrongly.
pub const USAGE_ERROR: FailureKind = FailureKind::new("UsageError");
pub const COMMAND_FAILED: FailureKind = FailureKind::new("CommandFailed");

const EX_USAGE: i32 = 64;
const EX_TEMPFAIL: i32 = 75;

const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Runs `sh -c <command>` taken from the job's metadata.
///
/// Recognised metadata keys: `command`, `description`, `max_retries`,
/// `retry_delay_secs`, `oops_recipients`, `error_recipients` and
/// `cooperative`. Output is stored back under `output` and `stderr`.
///
/// The command runs in its own process group, which is killed once the
/// command exits so background children cannot outlive the job. A
/// cooperative job (the default) also kills the group when its deadline
/// passes or its token is cancelled. With `cooperative: false` it waits on
/// the command unconditionally and relies on the worker watchdog to stop it.
///
/// Output is kept on failure too: a non-zero exit commits `output` and
/// `stderr` before the error is returned.
#[derive(Debug, Clone)]
pub struct ShellJob {
    command: Option<String>,
    description: Option<String>,
    cooperative: bool,
    max_retries: Option<u32>,
    backoff: FixedBackoff,
    oops_recipients: Vec<String>,
    error_recipients: Vec<String>,
}

impl ShellJob {
    pub fn from_job(job: &Job) -> Result<Self> {
        let backoff = job
            .metadata
            .get("retry_delay_secs")
            .and_then(Value::as_u64)
            .map(|secs| FixedBackoff::new(Duration::from_secs(secs)))
            .unwrap_or_default();
        Ok(Self {
            command: job.metadata_str("command").map(str::to_string),
            description: job.metadata_str("description").map(str::to_string),
            cooperative: job
                .metadata
                .get("cooperative")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            max_retries: job
                .metadata
                .get("max_retries")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            backoff,
            oops_recipients: string_list(job, "oops_recipients"),
            error_recipients: string_list(job, "error_recipients"),
        })
    }
}

impl JobBody for ShellJob {
    fn class_name(&self) -> &'static str {
        SHELL_JOB
    }

    fn module_name(&self) -> &'static str {
        module_path!()
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> std::result::Result<(), JobError> {
        let command = self
            .command
            .clone()
            .ok_or_else(|| JobError::new(USAGE_ERROR, "job has no command"))?;
        ctx.check_deadline()?;
        tracing::info!(job_id = ctx.job_id(), command = %command, "Executing command");

        let limit = self.cooperative.then(|| TimeLimit {
            token: ctx.deadline().token().clone(),
            remaining: ctx.deadline().remaining(),
        });
        let execution = block_on(execute(&command, limit))??;
        let Execution::Exited {
            status,
            stdout,
            stderr,
        } = execution
        else {
            tracing::warn!(job_id = ctx.job_id(), "Command overran deadline, killed");
            return Err(JobError::timeout(format!("`{command}` exceeded its deadline")));
        };
        let exit_code = status.code();
        tracing::info!(job_id = ctx.job_id(), exit_code = ?exit_code, "Command finished");

        if !stdout.is_empty() {
            ctx.set_metadata("output", stdout);
        }
        if !stderr.is_empty() {
            ctx.set_metadata("stderr", stderr.clone());
        }
        if exit_code != Some(0) {
            if let Err(e) = ctx.persist_metadata() {
                tracing::warn!(job_id = ctx.job_id(), error = %e, "Failed to save command output");
            }
        }

        let detail = if stderr.trim().is_empty() {
            format!("`{command}` exited with {status}")
        } else {
            format!("`{command}` exited with {status}: {}", stderr.trim())
        };
        match exit_code {
            Some(0) => Ok(()),
            Some(EX_TEMPFAIL) => Err(JobError::new(TEMP_FAIL, detail)),
            Some(EX_USAGE) => Err(JobError::new(USAGE_ERROR, detail)),
            _ => Err(JobError::new(COMMAND_FAILED, detail)),
        }
    }

    fn user_error_types(&self) -> &[FailureKind] {
        &[USAGE_ERROR]
    }

    fn retry_error_types(&self) -> &[FailureKind] {
        &[TEMP_FAIL]
    }

    fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn backoff(&self) -> &dyn BackoffPolicy {
        &self.backoff
    }

    fn oops_recipients(&self) -> Vec<String> {
        self.oops_recipients.clone()
    }

    fn error_recipients(&self) -> Vec<String> {
        self.error_recipients.clone()
    }

    fn operation_description(&self) -> String {
        match (&self.description, &self.command) {
            (Some(description), _) => description.clone(),
            (None, Some(command)) => format!("running `{command}`"),
            (None, None) => "running a shell command".to_string(),
        }
    }

    fn oops_vars(&self) -> Vec<(String, String)> {
        self.command
            .iter()
            .map(|command| ("command".to_string(), command.clone()))
            .collect()
    }
}

fn string_list(job: &Job, key: &str) -> Vec<String> {
    job.metadata
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Stops the command once it passes.
struct TimeLimit {
    token: CancellationToken,
    remaining: Option<Duration>,
}

impl TimeLimit {
    async fn expired(&self) {
        match self.remaining {
            Some(remaining) => tokio::select! {
                _ = self.token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => {}
            },
            None => self.token.cancelled().await,
        }
    }
}

enum Execution {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

/// Runs `future` from a blocking job thread, on the surrounding runtime when
/// there is one.
fn block_on<F: std::future::Future>(future: F) -> std::io::Result<F::Output> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(future)),
        Err(_) => Ok(Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(future)),
    }
}

async fn execute(command: &str, limit: Option<TimeLimit>) -> std::io::Result<Execution> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let group = child.id().and_then(ProcessGroup::track);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = {
        let waiting = async {
            let status = child.wait().await;
            // Background children may still hold the pipes open.
            if let Some(group) = &group {
                group.kill();
            }
            status
        };
        let run = async { tokio::join!(waiting, read_capped(stdout), read_capped(stderr)) };
        match &limit {
            Some(limit) => tokio::select! {
                result = run => Some(result),
                _ = limit.expired() => None,
            },
            None => Some(run.await),
        }
    };

    match finished {
        Some((status, stdout, stderr)) => Ok(Execution::Exited {
            status: status?,
            stdout,
            stderr,
        }),
        None => {
            match &group {
                Some(group) => group.kill(),
                None => child.start_kill()?,
            }
            if let Err(e) = child.wait().await {
                tracing::warn!(command, error = %e, "Failed to reap killed command");
            }
            Ok(Execution::TimedOut)
        }
    }
}

async fn read_capped(pipe: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES - kept.len();
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed reading command output");
                break;
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}
