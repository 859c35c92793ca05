//! Retry scheduling
//!
//! Computes how long a failing (key, model) pair cools down before it is tried again.

use crate::client::classifier::{ClassifiedError, ErrorKind};
use crate::config::EngineSettings;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of scheduling a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Cool down until the given instant
    RetryAt(DateTime<Utc>),
    /// Never retry automatically
    Disable,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction applied either side of the computed delay
    pub jitter: f64,
    /// Cool-down for quota failures with no known reset time
    pub quota_fallback: Duration,
    /// Transient failures tolerated before a pair is disabled
    pub max_transient_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
            jitter: 0.2,
            quota_fallback: Duration::from_secs(24 * 60 * 60),
            max_transient_failures: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_transient_failures: settings.max_transient_failures,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// `min(2^retry_count * base, max)` with jitter
    pub fn exponential(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let interval = self.base.saturating_mul(factor).min(self.max);

        let mut backoff = ExponentialBackoff {
            current_interval: interval,
            initial_interval: interval,
            randomization_factor: self.jitter,
            multiplier: 1.0,
            max_interval: self.max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        backoff.next_backoff().unwrap_or(interval)
    }

    /// Schedule a failure. `retry_count` is the count before this failure was recorded.
    pub fn schedule(
        &self,
        error: &ClassifiedError,
        retry_count: u32,
        quota_reset_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match error.kind {
            ErrorKind::Auth => RetryDecision::Disable,
            ErrorKind::RateLimit => {
                let wait = error
                    .retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.exponential(retry_count));
                RetryDecision::RetryAt(add(now, wait))
            }
            ErrorKind::Quota => match quota_reset_at {
                Some(reset) if reset > now => RetryDecision::RetryAt(reset),
                _ => RetryDecision::RetryAt(add(now, self.quota_fallback)),
            },
            ErrorKind::Server | ErrorKind::Network | ErrorKind::Unknown => {
                if retry_count + 1 > self.max_transient_failures {
                    RetryDecision::Disable
                } else {
                    RetryDecision::RetryAt(add(now, self.exponential(retry_count)))
                }
            }
        }
    }
}

fn add(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
