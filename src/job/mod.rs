pub mod record;
pub mod snapshot;

pub use record::{Job, JobId, JobStatus, NewJob, COMPLETED_STEPS_KEY};
pub use snapshot::JobState;
