use std::time::Duration;

/// Timing of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Wait after a successful cycle.
    pub interval: Duration,
    /// Wait after the first failed cycle.
    pub error_backoff: Duration,
    /// Ceiling for the wait after repeated failures.
    pub max_backoff: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    Failure,
}

/// Delay before the next cycle. The first failure waits `error_backoff`,
/// each further consecutive failure doubles it up to `max_backoff`, and any
/// success resets the count.
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: PollSchedule,
    failures: u32,
}

impl Backoff {
    pub fn new(schedule: PollSchedule) -> Self {
        Self {
            schedule,
            failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn next_delay(&mut self, outcome: PollOutcome) -> Duration {
        match outcome {
            PollOutcome::Success => {
                self.failures = 0;
                self.schedule.interval
            }
            PollOutcome::Failure => {
                let factor = 2u32.saturating_pow(self.failures.min(16));
                self.failures = self.failures.saturating_add(1);
                self.schedule
                    .error_backoff
                    .saturating_mul(factor)
                    .min(self.schedule.max_backoff)
            }
        }
    }
}
