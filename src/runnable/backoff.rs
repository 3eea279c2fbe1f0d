use std::time::Duration;

/// Delay applied to `scheduled_start` when a job is requeued after a
/// retryable failure.
pub trait BackoffPolicy: Send + Sync {
    /// `attempt_count` is the number of attempts already made (at least 1).
    fn delay(&self, attempt_count: u32) -> Duration;
}

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAY)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt_count: u32) -> Duration {
        self.delay
    }
}

/// Short fixed delays for the first few attempts, then a steady delay.
#[derive(Debug, Clone)]
pub struct SteppedBackoff {
    initial: Vec<Duration>,
    steady: Duration,
}

impl SteppedBackoff {
    pub fn new(initial: Vec<Duration>, steady: Duration) -> Self {
        Self { initial, steady }
    }
}

impl BackoffPolicy for SteppedBackoff {
    fn delay(&self, attempt_count: u32) -> Duration {
        let index = attempt_count.saturating_sub(1) as usize;
        self.initial.get(index).copied().unwrap_or(self.steady)
    }
}

pub(crate) static DEFAULT_BACKOFF: FixedBackoff = FixedBackoff::new(DEFAULT_RETRY_DELAY);
