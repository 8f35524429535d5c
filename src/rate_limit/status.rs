//! Status snapshots and cumulative statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};

use crate::queue::QueueStatus;
use crate::rate_limit::CircuitState;
use crate::types::{DenyReason, EndpointCategory, VerificationTier};

/// Cumulative limiter counters. Persisted across restarts.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterStats {
    /// Checks performed
    pub total_requests: u64,
    /// Checks that admitted the request
    pub allowed: u64,
    /// Denials by the circuit breaker
    pub denied_circuit_open: u64,
    /// Denials by the penalty budget
    pub denied_penalty: u64,
    /// Denials by a token bucket
    pub denied_token_bucket: u64,
    /// Denials by a sliding window
    pub denied_sliding_window: u64,
    /// Waits that gave up on timeout or cancellation
    pub wait_timeouts: u64,
    /// Checks for endpoints missing from the catalog
    pub unknown_endpoints: u64,
    /// Operations reported successful
    pub operation_successes: u64,
    /// Operations reported failed
    pub operation_failures: u64,
    /// Penalty points charged
    pub penalty_points_charged: f64,
    /// Time spent waiting for admission
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub total_wait: Duration,
}

impl LimiterStats {
    /// Total denials across all gates.
    pub fn denied(&self) -> u64 {
        self.denied_circuit_open
            + self.denied_penalty
            + self.denied_token_bucket
            + self.denied_sliding_window
    }

    pub(crate) fn record_denial(&mut self, reason: DenyReason) {
        match reason {
            DenyReason::CircuitOpen => self.denied_circuit_open += 1,
            DenyReason::PenaltyBudgetExceeded => self.denied_penalty += 1,
            DenyReason::TokenBucketEmpty => self.denied_token_bucket += 1,
            DenyReason::SlidingWindowFull => self.denied_sliding_window += 1,
        }
    }
}

/// Bucket and window occupancy of one endpoint category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStatus {
    /// Category
    pub category: EndpointCategory,
    /// Tokens available now
    pub tokens_available: f64,
    /// Bucket capacity
    pub bucket_capacity: f64,
    /// Requests in the current window
    pub window_count: u32,
    /// Window ceiling
    pub window_limit: u32,
}

impl CategoryStatus {
    /// Fraction of the bucket consumed.
    pub fn token_utilization(&self) -> f64 {
        if self.bucket_capacity <= 0.0 {
            return 1.0;
        }
        1.0 - self.tokens_available / self.bucket_capacity
    }

    /// Fraction of the window used.
    pub fn window_utilization(&self) -> f64 {
        if self.window_limit == 0 {
            return 1.0;
        }
        self.window_count as f64 / self.window_limit as f64
    }
}

/// Penalty budget occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PenaltyStatus {
    /// Points currently charged
    pub points: f64,
    /// Budget ceiling
    pub max_points: f64,
    /// Points decayed per second
    pub decay_rate: f64,
    /// `points / max_points`
    pub utilization: f64,
}

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted
    pub failure_count: u32,
    /// Times the breaker has opened
    pub trips: u64,
}

/// Point-in-time view of the whole limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Tier in effect
    pub tier: VerificationTier,
    /// Whether limiting is enabled
    pub enabled: bool,
    /// Public category occupancy
    pub public: CategoryStatus,
    /// Private category occupancy
    pub private: CategoryStatus,
    /// Penalty budget occupancy
    pub penalty: PenaltyStatus,
    /// Breaker state, if the breaker is enabled
    pub circuit_breaker: Option<BreakerStatus>,
    /// Queue depth and counters, if the queue is enabled
    pub queue: Option<QueueStatus>,
    /// Orders with a tracked creation time
    pub tracked_orders: usize,
    /// Whether snapshots are being written
    pub persistence_active: bool,
    /// Cumulative counters
    pub stats: LimiterStats,
}

impl RateLimitStatus {
    /// Occupancy of one category.
    pub fn category(&self, category: EndpointCategory) -> &CategoryStatus {
        match category {
            EndpointCategory::Public => &self.public,
            EndpointCategory::Private => &self.private,
        }
    }
}
