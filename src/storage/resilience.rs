//! Retry with backoff, and circuit breaking for replicas.
//!
//! # Retry
//!
//! Only [`Error::Connectivity`] is retried. The delay before attempt `n`
//! (1-based, after the first failure) is
//! `min(base_delay * 2^(n-1), max_delay)` plus up to 25% random jitter.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open |
//! +--------+                               +------+
//!     ^                                        |
//!     |  success                               | timeout elapsed
//!     |                                        v
//!     +--------------------------------  +-----------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! The connection manager keeps one breaker per read replica and skips
//! replicas whose breaker rejects calls.

use crate::config::RetrySettings;
use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2_000),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32 << (retry - 1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to 25% random jitter.
    #[must_use]
    pub fn delay_with_jitter(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let max_jitter = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        if max_jitter == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..=max_jitter);
        delay + Duration::from_millis(jitter)
    }
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
///
/// # Errors
///
/// Returns the last error. Exhausted retries surface as
/// [`Error::Connectivity`] with the attempt count in the cause.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    backend: &'static str,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_with_jitter(attempt);
                tracing::warn!(
                    backend,
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after connectivity failure"
                );
                metrics::counter!(
                    "storage_retries_total",
                    "backend" => backend,
                    "operation" => operation
                )
                .increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(Error::Connectivity { cause, .. }) if max_attempts > 1 => {
                tracing::error!(backend, operation, attempts = attempt, "Retries exhausted");
                return Err(Error::connectivity(
                    operation,
                    backend,
                    format!("gave up after {attempt} attempts: {cause}"),
                ));
            },
            Err(e) => return Err(e),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to keep the circuit open before half-open.
    pub reset_timeout_ms: u64,
    /// Maximum trial calls while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reset_timeout_ms = timeout_ms;
        self
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { attempts: u32 },
}

/// Circuit breaker for one replica.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    target: String,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: &BreakerConfig, target: impl Into<String>) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            half_open_max_calls: config.half_open_max_calls.max(1),
            target: target.into(),
        }
    }

    /// Returns `true` if a call may proceed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    tracing::info!(target_name = %self.target, "Circuit breaker half-open");
                    self.state = BreakerState::HalfOpen { attempts: 1 };
                    self.publish();
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen { ref mut attempts } => {
                if *attempts >= self.half_open_max_calls {
                    false
                } else {
                    *attempts += 1;
                    true
                }
            },
        }
    }

    /// Records a success, closing the circuit.
    pub fn on_success(&mut self) {
        if !matches!(self.state, BreakerState::Closed { failures: 0 }) {
            tracing::info!(target_name = %self.target, "Circuit breaker closed");
        }
        self.state = BreakerState::Closed { failures: 0 };
        self.publish();
    }

    /// Records a failure. Returns `true` if the circuit just opened.
    pub fn on_failure(&mut self) -> bool {
        let tripped = match self.state {
            BreakerState::Closed { ref mut failures } => {
                *failures += 1;
                *failures >= self.failure_threshold
            },
            BreakerState::HalfOpen { .. } => true,
            BreakerState::Open { .. } => false,
        };
        if tripped {
            tracing::warn!(
                target_name = %self.target,
                threshold = self.failure_threshold,
                "Circuit breaker opened"
            );
            self.state = BreakerState::Open {
                opened_at: Instant::now(),
            };
            self.publish();
        }
        tripped
    }

    /// Returns the current state: 0 closed, 1 open, 2 half-open.
    #[must_use]
    pub const fn state_value(&self) -> u8 {
        match self.state {
            BreakerState::Closed { .. } => 0,
            BreakerState::Open { .. } => 1,
            BreakerState::HalfOpen { .. } => 2,
        }
    }

    /// What this breaker protects.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    fn publish(&self) {
        metrics::gauge!("storage_circuit_breaker_state", "target" => self.target.clone())
            .set(f64::from(self.state_value()));
    }
}
