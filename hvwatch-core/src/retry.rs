//! Retry policy and budget for migration tracking

use std::time::Duration;

/// How the delay between tracking polls grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Same delay before every poll
    #[default]
    Fixed,
    /// Delay multiplied by `factor` after each poll, capped at `max_interval`
    Exponential { factor: u32, max_interval: Duration },
}

/// Delay schedule and attempt limit for tracking polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay between polls
    pub interval: Duration,
    /// Maximum number of budgeted polls
    pub max_attempts: u32,
    /// Growth of the delay
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_attempts: 10,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay to wait after the given attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential {
                factor,
                max_interval,
            } => {
                let exponent = attempt.saturating_sub(1);
                let multiplier = factor.max(1).saturating_pow(exponent);
                self.interval
                    .checked_mul(multiplier)
                    .unwrap_or(max_interval)
                    .min(max_interval)
            }
        }
    }

    /// Fresh budget for one tracking run
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_attempts)
    }
}

/// Counter of consumed retries, bounded by a maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// Consume one retry. Returns the attempt number just used.
    pub fn consume(&mut self) -> u32 {
        self.used = self.used.saturating_add(1).min(self.max);
        self.used
    }

    /// Whether no retries remain
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}
