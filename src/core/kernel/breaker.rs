use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed logical requests that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Cooldown before an open circuit lets a trial request through.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<Instant>,
    /// A half-open trial is in flight; everyone else fails fast.
    trial_in_flight: bool,
}

/// Why a request was not let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub retry_in: Duration,
}

/// Fault-isolation state machine shared by every request of one adapter instance.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    /// Ask to run one logical request.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits exactly one trial at a time.
    pub fn try_acquire(&self) -> Result<(), Rejected> {
        let mut s = self.lock();
        let now = Instant::now();
        match s.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = s.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                let reset_timeout = self.config.reset_timeout();
                if elapsed < reset_timeout {
                    return Err(Rejected {
                        retry_in: reset_timeout - elapsed,
                    });
                }
                debug!("circuit half-open, admitting trial request");
                s.state = CircuitState::HalfOpen;
                s.consecutive_successes = 0;
                s.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    Err(Rejected {
                        retry_in: Duration::ZERO,
                    })
                } else {
                    s.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.lock();
        s.consecutive_failures = 0;
        if s.state == CircuitState::HalfOpen {
            s.trial_in_flight = false;
            s.consecutive_successes += 1;
            if s.consecutive_successes >= self.config.success_threshold {
                info!("circuit closed after successful trial");
                s.state = CircuitState::Closed;
                s.consecutive_successes = 0;
                s.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.lock();
        s.consecutive_failures += 1;
        s.consecutive_successes = 0;
        match s.state {
            CircuitState::HalfOpen => {
                warn!("trial request failed, circuit re-opened");
                s.trial_in_flight = false;
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
            }
            CircuitState::Closed if s.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    failures = s.consecutive_failures,
                    "failure threshold reached, circuit opened"
                );
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    /// Give back a half-open trial slot without a verdict, e.g. on cancellation.
    pub fn release_trial(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen {
            s.trial_in_flight = false;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
