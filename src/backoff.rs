use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

/// Upper bound on the exponent walked by [`ExponentialPolicy`]. Past this the
/// delay is pinned at `max_delay` anyway.
const MAX_BACKOFF_STEPS: u32 = 32;

/// Decides how long a failed job waits before the reconciler may requeue it.
pub trait RetryPolicy: Send + Sync {
    /// Delay for a job that has already been requeued `retry_count` times.
    fn delay_for(&self, retry_count: u32) -> Duration;
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub Duration);

impl RetryPolicy for FixedPolicy {
    fn delay_for(&self, _retry_count: u32) -> Duration {
        self.0
    }
}

/// Exponential delay: `min_delay * factor^retry_count`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialPolicy {
    min_delay: Duration,
    max_delay: Duration,
    factor: f32,
}

impl ExponentialPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, factor: f32) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            factor: if factor >= 1.0 { factor } else { 1.0 },
        }
    }
}

impl Default for ExponentialPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300), 2.0)
    }
}

impl RetryPolicy for ExponentialPolicy {
    fn delay_for(&self, retry_count: u32) -> Duration {
        let step = retry_count.min(MAX_BACKOFF_STEPS) as usize;

        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.factor)
            .with_max_times(step + 1)
            .build()
            .nth(step)
            .unwrap_or(self.max_delay)
    }
}
