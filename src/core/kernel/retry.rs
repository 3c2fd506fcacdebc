//! Bounded retry with exponential backoff for logical HTTP requests.

use crate::core::errors::ClassifiedError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Immutable retry settings, one per client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Authoritative verdict for plain HTTP status failures.
    pub retryable_status_codes: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            ..Self::default()
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, i.e. after the `attempt`-th failure (1-based):
    /// `min(initial * multiplier^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Every delay a call that keeps failing would wait through.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt)).collect()
    }

    /// Delay for `attempt`, lengthened to honour a retry-after hint up to `max_delay_ms`.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let scheduled = self.delay_for(attempt);
        match hint {
            Some(hint) => scheduled.max(hint.min(Duration::from_millis(self.max_delay_ms))),
            None => scheduled,
        }
    }

    /// Whether `error` should be retried by this policy.
    ///
    /// A plain HTTP status failure (no venue code) follows `retryable_status_codes`;
    /// everything else follows the classifier's verdict.
    pub fn should_retry(&self, error: &ClassifiedError) -> bool {
        match (error.status, &error.venue_code) {
            (Some(status), None) => self.retryable_status_codes.contains(&status),
            _ => error.retryable,
        }
    }
}
