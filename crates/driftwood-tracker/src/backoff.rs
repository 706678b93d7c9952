//! Announce failure backoff.

use std::time::Duration;

/// Wait after the first failure.
pub const BASE_FAIL_WAIT: Duration = Duration::from_secs(50);

const GROWTH: f64 = 1.4;
const JITTER_SPAN: f64 = 0.2;

/// Failure wait that grows by 1.4 to 1.6 per consecutive failure, capped.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    current: Option<Duration>,
    max: Duration,
}

impl Backoff {
    /// Healthy backoff capped at `max`.
    #[must_use]
    pub const fn new(max: Duration) -> Self {
        Self { current: None, max }
    }

    /// Current wait; `None` while healthy.
    #[must_use]
    pub const fn current(&self) -> Option<Duration> {
        self.current
    }

    /// Record a failure and return the wait before the next attempt.
    /// `jitter` is a sample from `0.0..=1.0`.
    pub fn fail(&mut self, jitter: f64) -> Duration {
        let next = match self.current {
            None => BASE_FAIL_WAIT,
            Some(previous) => {
                previous.mul_f64(GROWTH + jitter.clamp(0.0, 1.0) * JITTER_SPAN)
            }
        };
        let next = next.min(self.max);
        self.current = Some(next);
        next
    }

    /// Forget past failures.
    pub const fn reset(&mut self) {
        self.current = None;
    }

    /// Change the cap; an active wait is clamped to it.
    pub fn set_max(&mut self, max: Duration) {
        self.max = max;
        self.current = self.current.map(|wait| wait.min(max));
    }
}
