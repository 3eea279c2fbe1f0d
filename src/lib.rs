pub mod clock;
pub mod config;
pub mod delegation;
pub mod error;
pub mod job;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod oops;
pub mod process_group;
pub mod registry;
pub mod runnable;
pub mod runner;
pub mod services;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{Result, RunnerError};
pub use job::{Job, JobId, JobStatus, NewJob};
pub use runnable::{JobBody, JobError, RunnableJob};
pub use services::Services;
