//! Embedded circuit breaker.
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ─────────────────────────────────▶ Open
//!     ▲                                        │ recovery_timeout elapsed,
//!     │ successes >= success_threshold         │ checked lazily by can_proceed()
//!     │                                        ▼
//!     └──────────────────────────────────── HalfOpen ──(any failure)──▶ Open
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are refused until the recovery timeout elapses
    Open,
    /// Probe requests are allowed; the next outcomes decide the state
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing probes.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Trip/recovery state machine guarding the exchange.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    /// Number of Closed/HalfOpen -> Open transitions
    trips: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            trips: 0,
        }
    }

    /// Check if a request may proceed.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open here.
    pub fn can_proceed(&mut self, now: Instant) -> bool {
        if self.state == CircuitState::Open && self.retry_after(now).is_zero() {
            tracing::info!("Circuit breaker recovery timeout elapsed, half-open");
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
        }
        self.state != CircuitState::Open
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    tracing::info!("Circuit breaker closed");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => self.trip(),
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self) {
        tracing::warn!(
            failures = self.failure_count,
            recovery_timeout = ?self.config.recovery_timeout,
            "Circuit breaker tripped"
        );
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.trips += 1;
    }

    /// Time left until an open breaker allows a probe. Zero unless open.
    pub fn retry_after(&self, now: Instant) -> Duration {
        match (self.state, self.last_failure) {
            (CircuitState::Open, Some(last)) => {
                (last + self.config.recovery_timeout).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Current state, without applying the lazy open -> half-open transition.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Total number of trips since creation.
    pub fn trips(&self) -> u64 {
        self.trips
    }

    /// Thresholds in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
