//! Tests for the `job-runner` command line.

use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn job_runner(database: &Path, args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_job-runner"))
        .arg("--database")
        .arg(database)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "job-runner {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn json_output(database: &Path, args: &[&str]) -> Value {
    let output = job_runner(database, args);
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_submit_run_and_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    let submitted = json_output(&db, &["job", "-o", "json", "submit", "echo from-cli"]);
    let job_id = submitted["job_id"].as_i64().unwrap();

    let status = json_output(&db, &["job", "-o", "json", "status", &job_id.to_string()]);
    assert_eq!(status["status"], "WAITING");
    assert_eq!(status["attempt_count"], 0);

    job_runner(&db, &["run", "--dry-run"]);

    let status = json_output(&db, &["job", "-o", "json", "status", &job_id.to_string()]);
    assert_eq!(status["status"], "COMPLETED");
    assert_eq!(status["attempt_count"], 1);
    assert_eq!(status["metadata"]["output"], "from-cli\n");
}

#[test]
fn test_submit_with_delay_is_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    job_runner(&db, &["job", "submit", "true", "--delay-secs", "3600"]);
    job_runner(&db, &["run", "--dry-run"]);

    let list = json_output(&db, &["job", "-o", "json", "list"]);
    assert_eq!(list["total_count"], 1);
    assert_eq!(list["jobs"][0]["status"], "WAITING");
}

#[test]
fn test_failed_job_writes_oops_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");
    let oops_dir = dir.path().join("oops");

    job_runner(&db, &["job", "submit", "exit 9"]);
    let oops_arg = format!("--oops-dir={}", oops_dir.display());
    job_runner(&db, &["run", "--dry-run", &oops_arg]);

    let list = json_output(&db, &["job", "-o", "json", "list"]);
    assert_eq!(list["jobs"][0]["status"], "FAILED");

    let reports: Vec<_> = std::fs::read_dir(&oops_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(reports.len(), 1);
    let report: Value = serde_json::from_slice(&std::fs::read(&reports[0]).unwrap()).unwrap();
    assert_eq!(report["kind"], "CommandFailed");
    assert!(report["id"].as_str().unwrap().starts_with("OOPS-"));
}

#[test]
fn test_pool_subcommand_runs_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    job_runner(&db, &["job", "submit", "echo one"]);
    job_runner(&db, &["job", "submit", "echo two"]);
    job_runner(&db, &["pool", "--dry-run", "--max-workers", "2"]);

    let list = json_output(&db, &["job", "-o", "json", "list"]);
    assert_eq!(list["total_count"], 2);
    for job in list["jobs"].as_array().unwrap() {
        assert_eq!(job["status"], "COMPLETED");
    }
}

#[test]
fn test_failed_job_keeps_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    let submitted = json_output(&db, &["job", "-o", "json", "submit", "echo broken >&2; exit 9"]);
    let job_id = submitted["job_id"].as_i64().unwrap();
    job_runner(&db, &["run", "--dry-run"]);

    let status = json_output(&db, &["job", "-o", "json", "status", &job_id.to_string()]);
    assert_eq!(status["status"], "FAILED");
    assert_eq!(status["metadata"]["stderr"], "broken\n");
}

#[test]
fn test_background_child_does_not_stall_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");

    let submitted = json_output(&db, &["job", "-o", "json", "submit", "sleep 100 & echo hi"]);
    let job_id = submitted["job_id"].as_i64().unwrap();

    let started = std::time::Instant::now();
    job_runner(&db, &["run", "--dry-run"]);
    assert!(started.elapsed() < std::time::Duration::from_secs(30));

    let status = json_output(&db, &["job", "-o", "json", "status", &job_id.to_string()]);
    assert_eq!(status["status"], "COMPLETED");
    assert_eq!(status["metadata"]["output"], "hi\n");
}
