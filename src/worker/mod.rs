//! Subprocess workers for running untrusted job bodies.
//!
//! The pool driver and its workers talk over the worker's stdin and stdout:
//! - **Driver side** ([`WorkerPool`]): starts workers lazily, sends one job at
//!   a time to an idle worker, and kills workers that overrun their deadline
//! - **Worker side** ([`serve`]): runs each job on a blocking thread under a
//!   deadline watchdog and answers with a success flag and an OOPS id
//!
//! # Execution Flow
//!
//! 1. Driver leases the job and commits
//! 2. [`WorkerPool::run_job`] sends `RunJob { job_id, deadline }`
//! 3. The worker loads the job, runs it, and replies
//! 4. A worker whose job did not complete is stopped; a successful one is
//!    kept for the next job
//!
//! Logs from workers go to stderr, which the driver inherits.

pub mod pool;
pub mod process;
pub mod protocol;

pub use pool::{DispatchError, WorkerPool};
pub use process::{process_exit, serve, ExitHook, WorkerEnvironment};
pub use protocol::{RunJobResponse, WorkerRequest, TIMEOUT_EXIT_CODE};
