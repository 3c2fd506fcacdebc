use crate::core::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

const MIN_WAIT: Duration = Duration::from_millis(1);
const MAX_WAIT: Duration = Duration::from_secs(86_400);

/// Token bucket settings supplied by each adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
    /// Operation name to token cost. Unknown names cost 1.
    pub weights: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_second: 10.0,
            weights: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            weights: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, operation: impl Into<String>, weight: u32) -> Self {
        self.weights.insert(operation.into(), weight);
        self
    }

    /// Reject buckets that can never admit or refill.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "rate_limit.capacity must be positive".to_string(),
            ));
        }
        if !(self.refill_per_second.is_finite() && self.refill_per_second > 0.0) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "rate_limit.refill_per_second must be a positive number, got {}",
                self.refill_per_second
            )));
        }
        if let Some((name, _)) = self.weights.iter().find(|(_, weight)| **weight == 0) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "rate_limit.weights.{} must be positive",
                name
            )));
        }
        Ok(())
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(MAX_WAIT)
}

/// Mutable bucket state. Only [`TokenBucketLimiter`] touches it.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_second: f64,
    /// May sit in the future while an over-capacity acquisition is being paid off.
    pub last_refill: Instant,
}

impl RateLimitState {
    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `weight` tokens if possible, otherwise report how long to wait before re-checking.
    fn take(&mut self, weight: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= weight {
            self.tokens -= weight;
            return Ok(());
        }

        // Over-capacity weights go through once the bucket is full; the
        // excess is charged by pushing the refill clock forward.
        if weight > self.capacity && self.tokens >= self.capacity {
            let excess = (weight - self.capacity) / self.refill_per_second;
            self.tokens = 0.0;
            self.last_refill = now + seconds(excess).min(MAX_WAIT);
            return Ok(());
        }

        let target = weight.min(self.capacity);
        let mut wait = (target - self.tokens) / self.refill_per_second;
        if self.last_refill > now {
            wait += self.last_refill.duration_since(now).as_secs_f64();
        }
        // Sub-millisecond waits round up to one timer tick so the loop always makes progress
        Err(seconds(wait).clamp(MIN_WAIT, MAX_WAIT))
    }
}

/// Weighted token bucket gating every outbound venue operation.
///
/// Refill is computed lazily on each acquisition. Waiters re-check after
/// sleeping since concurrent callers may have raced them for the refilled
/// tokens; there is no fairness beyond the timer wake order. Dropping the
/// `acquire` future abandons the wait with no side effects.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    state: Mutex<RateLimitState>,
    weights: HashMap<String, u32>,
}

impl TokenBucketLimiter {
    /// Create a full bucket.
    pub fn new(config: &RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = f64::from(config.capacity);
        Ok(Self {
            state: Mutex::new(RateLimitState {
                capacity,
                tokens: capacity,
                refill_per_second: config.refill_per_second,
                last_refill: Instant::now(),
            }),
            weights: config.weights.clone(),
        })
    }

    pub fn weight_of(&self, operation: &str) -> u32 {
        self.weights.get(operation).copied().unwrap_or(1)
    }

    /// Suspend until `operation`'s weight has been admitted.
    pub async fn acquire(&self, operation: &str) {
        let weight = self.weight_of(operation);
        let mut waited = false;

        loop {
            match self.try_take(weight) {
                Ok(()) => {
                    if waited {
                        debug!(operation, weight, "rate limit permit granted after waiting");
                    }
                    return;
                }
                Err(wait) => {
                    trace!(operation, weight, wait_ms = wait.as_millis() as u64, "waiting for tokens");
                    waited = true;
                    sleep(wait).await;
                }
            }
        }
    }

    /// Take the permit only if it is available right now.
    pub fn try_acquire(&self, operation: &str) -> bool {
        self.try_take(self.weight_of(operation)).is_ok()
    }

    /// Tokens available at this instant, after lazy refill.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        state.refill(Instant::now());
        state.tokens
    }

    pub fn snapshot(&self) -> RateLimitState {
        self.lock().clone()
    }

    fn try_take(&self, weight: u32) -> Result<(), Duration> {
        self.lock().take(f64::from(weight), Instant::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimitState> {
        // The state is plain numbers; a panic elsewhere cannot leave it torn.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, rate: f64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(&RateLimitConfig::new(capacity, rate).with_weight("createOrder", 5))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_acquire_without_suspension() {
        let limiter = limiter(10, 1.0);
        let start = Instant::now();

        limiter.acquire("createOrder").await;
        limiter.acquire("createOrder").await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(limiter.available() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_acquire_suspends_until_refilled() {
        let limiter = limiter(10, 1.0);
        limiter.acquire("createOrder").await;
        limiter.acquire("createOrder").await;

        let start = Instant::now();
        limiter.acquire("createOrder").await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_operation_costs_one() {
        let limiter = limiter(3, 1.0);
        assert_eq!(limiter.weight_of("fetchTicker"), 1);

        limiter.acquire("fetchTicker").await;
        assert!((limiter.available() - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_clamped_to_capacity() {
        let limiter = limiter(10, 2.0);
        limiter.acquire("createOrder").await;
        limiter.acquire("createOrder").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((limiter.available() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_capacity_weight_eventually_succeeds() {
        let limiter =
            TokenBucketLimiter::new(&RateLimitConfig::new(4, 1.0).with_weight("batchOrders", 10))
                .unwrap();

        let start = Instant::now();
        limiter.acquire("batchOrders").await;
        assert!(start.elapsed() < Duration::from_millis(1));

        // The excess of 6 tokens is paid back before anyone else gets in
        assert!(!limiter.try_acquire("fetchTicker"));
        let start = Instant::now();
        limiter.acquire("fetchTicker").await;
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[test]
    fn test_rejects_buckets_that_cannot_refill() {
        for rate in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let err = TokenBucketLimiter::new(&RateLimitConfig::new(1, rate)).unwrap_err();
            assert!(err.to_string().contains("refill_per_second"), "rate {}", rate);
        }
        assert!(TokenBucketLimiter::new(&RateLimitConfig::new(0, 1.0)).is_err());
        assert!(
            TokenBucketLimiter::new(&RateLimitConfig::new(5, 1.0).with_weight("cancelOrder", 0))
                .is_err()
        );
    }

    #[test]
    fn test_wait_is_bounded_for_tiny_rates() {
        let now = Instant::now();
        let mut state = RateLimitState {
            capacity: 1.0,
            tokens: 0.0,
            refill_per_second: f64::MIN_POSITIVE,
            last_refill: now,
        };
        assert_eq!(state.take(1.0, now), Err(MAX_WAIT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_has_no_side_effects() {
        let limiter = limiter(10, 1.0);
        limiter.acquire("createOrder").await;
        limiter.acquire("createOrder").await;

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), limiter.acquire("createOrder")).await;
        assert!(abandoned.is_err());

        // Only refill happened while waiting; nothing was taken
        assert!((limiter.available() - 1.0).abs() < 1e-6);
    }
}
