use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Cool-down schedule for subjects that failed permanently.
///
/// A subject with `n` recorded attempts becomes eligible again once
/// `last_attempt + base_interval * 2^n` has passed, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_interval: TimeDelta,
    pub max_delay: TimeDelta,
    /// Attempts after which a subject is marked permanently failed.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval: TimeDelta::hours(12),
            max_delay: TimeDelta::days(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempts: u32) -> TimeDelta {
        let factor = 1i32.checked_shl(attempts.min(30)).unwrap_or(i32::MAX);
        self.base_interval
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn next_eligible_at(&self, attempts: u32, last_attempt: DateTime<Utc>) -> DateTime<Utc> {
        last_attempt + self.delay_for(attempts)
    }

    pub fn is_eligible(
        &self,
        attempts: u32,
        last_attempt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match last_attempt {
            None => true,
            Some(_) if attempts == 0 => true,
            Some(last) => now >= self.next_eligible_at(attempts, last),
        }
    }

    /// Whether the attempt about to be recorded is the last one allowed.
    pub fn exhausts(&self, attempts_after: u32) -> bool {
        attempts_after >= self.max_attempts
    }
}

/// In-place retry schedule for transient failures within one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientRetry {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl TransientRetry {
    /// No retries and no waiting. Used by tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }
}
