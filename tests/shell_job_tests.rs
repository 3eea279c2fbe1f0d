//! Integration tests for the built-in shell command job.

mod test_harness;

use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use job_runner::jobs::builtin_registry;
use job_runner::jobs::shell::{COMMAND_FAILED, SHELL_JOB};
use job_runner::job::{JobId, JobStatus, NewJob};
use job_runner::store::JobStore;
use serde_json::json;
use test_harness::{start_time, Harness};
use tokio_util::sync::CancellationToken;

fn shell_harness() -> Harness {
    Harness::new(builtin_registry())
}

fn submit(h: &Harness, new_job: NewJob) -> JobId {
    let job = h.services.create_job(new_job).unwrap();
    h.store.commit().unwrap();
    job.id
}

fn command(cmd: &str) -> NewJob {
    NewJob::new(SHELL_JOB).with_metadata("command", cmd)
}

#[test]
fn test_execute_simple_command() {
    let h = shell_harness();
    let id = submit(&h, command("echo hello"));

    let runner = h.run_pass();

    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata_str("output"), Some("hello\n"));
    assert!(job.metadata.get("stderr").is_none());
    assert_eq!(runner.completed_jobs(), &[id]);
}

#[test]
fn test_execute_large_output() {
    let h = shell_harness();
    let id = submit(&h, command("seq 1 1000"));

    h.run_pass();

    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata_str("output").unwrap().lines().count(), 1000);
}

#[test]
fn test_command_failure_files_oops() {
    let h = shell_harness();
    let id = submit(&h, command("echo 'error message' >&2 && exit 3"));

    let runner = h.run_pass();

    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.metadata_str("stderr"), Some("error message\n"));

    let report = &runner.oops_reports()[0];
    assert_eq!(report.kind, COMMAND_FAILED.name());
    assert!(report.value.contains("error message"));
    assert_eq!(report.vars.get("command").map(String::as_str), Some("echo 'error message' >&2 && exit 3"));
}

#[test]
fn test_usage_error_mails_requester() {
    let h = shell_harness();
    let id = submit(
        &h,
        command("exit 64")
            .with_metadata("description", "building the docs")
            .with_metadata("error_recipients", json!(["requester@example.com"])),
    );

    let runner = h.run_pass();

    assert_eq!(h.job(id).status, JobStatus::Failed);
    assert!(runner.oops_reports().is_empty());
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Error while building the docs");
}

#[test]
fn test_missing_command_is_a_user_error() {
    let h = shell_harness();
    let id = submit(&h, NewJob::new(SHELL_JOB));

    let runner = h.run_pass();

    assert_eq!(h.job(id).status, JobStatus::Failed);
    assert!(runner.oops_reports().is_empty());
    assert!(h.publisher.reports().is_empty());
}

#[test]
fn test_temp_fail_is_retried() {
    let h = shell_harness();
    let id = submit(
        &h,
        command("exit 75")
            .with_metadata("retry_delay_secs", 60)
            .with_metadata("max_retries", 1),
    );

    h.run_pass();
    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.scheduled_start, start_time() + ChronoDuration::seconds(60));

    h.advance(ChronoDuration::seconds(60));
    let runner = h.run_pass();
    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(runner.oops_reports()[0].kind, "TempFail");
}

#[test]
fn test_cancelled_command_is_killed() {
    let h = shell_harness();
    let id = submit(&h, command("sleep 30"));
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            token.cancel();
        })
    };

    let started = Instant::now();
    let mut runner = h.runner().with_cancellation(token);
    runner.run_ready().unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.job(id).status, JobStatus::Failed);
    assert_eq!(runner.oops_reports()[0].kind, "TimeoutError");
}

#[test]
fn test_jobs_run_in_schedule_order() {
    let h = shell_harness();
    let late = h
        .services
        .create_job(command("echo late").scheduled_at(start_time() - ChronoDuration::minutes(1)))
        .unwrap();
    let early = h
        .services
        .create_job(command("echo early").scheduled_at(start_time() - ChronoDuration::minutes(5)))
        .unwrap();
    h.store.commit().unwrap();

    let runner = h.run_pass();

    assert_eq!(runner.completed_jobs(), &[early.id, late.id]);
}

#[test]
fn test_background_child_does_not_hold_job_open() {
    let h = shell_harness();
    let id = submit(&h, command("sleep 100 & echo hi"));

    let started = Instant::now();
    h.run_pass();

    assert!(started.elapsed() < Duration::from_secs(10));
    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.metadata_str("output"), Some("hi\n"));
}

#[test]
fn test_failed_command_keeps_its_output() {
    let h = shell_harness();
    let id = submit(&h, command("echo partial; echo broken >&2; exit 3"));

    h.run_pass();

    let job = h.job(id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.metadata_str("output"), Some("partial\n"));
    assert_eq!(job.metadata_str("stderr"), Some("broken\n"));
}

/// Whether `pid` names a process that has not exited yet.
#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat.rsplit(')').next().map(str::trim).map(str::to_string))
        .is_some_and(|rest| !rest.starts_with('Z') && !rest.starts_with('X'))
}

#[cfg(target_os = "linux")]
#[test]
fn test_cancelled_command_takes_its_children_along() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let h = shell_harness();
    let id = submit(
        &h,
        command(&format!("sleep 4711 & echo $! > {}; wait", pid_file.display())),
    );
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            token.cancel();
        })
    };
    let mut runner = h.runner().with_cancellation(token);
    runner.run_ready().unwrap();
    canceller.join().unwrap();

    assert_eq!(h.job(id).status, JobStatus::Failed);
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let gone_by = Instant::now() + Duration::from_secs(5);
    while is_running(pid) && Instant::now() < gone_by {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!is_running(pid), "background child {pid} outlived its job");
}
