//! Per-tier rate limit ceilings and backoff constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::limits;
use crate::types::{EndpointCategory, VerificationTier};

/// Immutable limits for one account tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierProfile {
    /// Private endpoint requests per minute (sliding window)
    pub private_limit: u32,
    /// Private endpoint burst size (token bucket capacity)
    pub private_burst: u32,
    /// Public endpoint requests per minute (sliding window)
    pub public_limit: u32,
    /// Public endpoint burst size (token bucket capacity)
    pub public_burst: u32,
    /// Penalty point budget
    pub max_penalty_points: f64,
    /// Penalty points decayed per second
    pub penalty_decay_rate: f64,
    /// First backoff step, in seconds
    pub backoff_base: f64,
    /// Backoff growth per attempt
    pub backoff_multiplier: f64,
    /// Backoff ceiling, in seconds
    pub backoff_max: f64,
    /// Request queue capacity
    pub queue_capacity: usize,
}

impl TierProfile {
    /// Built-in profile for a verification tier.
    pub fn for_tier(tier: VerificationTier) -> Self {
        match tier {
            VerificationTier::Starter => Self {
                private_limit: limits::starter::PRIVATE_LIMIT,
                private_burst: limits::starter::PRIVATE_LIMIT,
                public_limit: limits::PUBLIC_LIMIT,
                public_burst: limits::PUBLIC_LIMIT,
                max_penalty_points: limits::starter::MAX_COUNTER as f64,
                penalty_decay_rate: limits::starter::DECAY_RATE,
                backoff_base: 1.0,
                backoff_multiplier: 2.0,
                backoff_max: 60.0,
                queue_capacity: 100,
            },
            VerificationTier::Intermediate => Self {
                private_limit: limits::intermediate::PRIVATE_LIMIT,
                private_burst: limits::intermediate::PRIVATE_LIMIT,
                public_limit: limits::PUBLIC_LIMIT,
                public_burst: limits::PUBLIC_LIMIT,
                max_penalty_points: limits::intermediate::MAX_COUNTER as f64,
                penalty_decay_rate: limits::intermediate::DECAY_RATE,
                backoff_base: 0.5,
                backoff_multiplier: 2.0,
                backoff_max: 30.0,
                queue_capacity: 500,
            },
            VerificationTier::Pro => Self {
                private_limit: limits::pro::PRIVATE_LIMIT,
                private_burst: limits::pro::PRIVATE_LIMIT,
                public_limit: limits::PUBLIC_LIMIT,
                public_burst: limits::PUBLIC_LIMIT,
                max_penalty_points: limits::pro::MAX_COUNTER as f64,
                penalty_decay_rate: limits::pro::DECAY_RATE,
                backoff_base: 0.25,
                backoff_multiplier: 1.5,
                backoff_max: 15.0,
                queue_capacity: 1000,
            },
        }
    }

    /// Per-minute ceiling for a category.
    pub fn limit(&self, category: EndpointCategory) -> u32 {
        match category {
            EndpointCategory::Public => self.public_limit,
            EndpointCategory::Private => self.private_limit,
        }
    }

    /// Burst size for a category.
    pub fn burst(&self, category: EndpointCategory) -> u32 {
        match category {
            EndpointCategory::Public => self.public_burst,
            EndpointCategory::Private => self.private_burst,
        }
    }

    /// Backoff for the given retry attempt: `min(base * multiplier^attempt, max)`.
    ///
    /// Saturates at [`Duration::MAX`] for profiles that were never validated.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let secs = (self.backoff_base * self.backoff_multiplier.powi(exponent))
            .min(self.backoff_max)
            .max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Longest backoff, saturating like [`backoff`](Self::backoff).
    pub fn max_backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.backoff_max.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Check the profile for values the limiter cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.private_limit == 0 || self.public_limit == 0 {
            return Err("per-minute limits must be positive".to_string());
        }
        if self.private_burst == 0 || self.public_burst == 0 {
            return Err("burst sizes must be positive".to_string());
        }
        if !(self.max_penalty_points > 0.0) || !(self.penalty_decay_rate > 0.0) {
            return Err("penalty budget and decay rate must be positive".to_string());
        }
        let rates = [
            self.max_penalty_points,
            self.penalty_decay_rate,
            self.backoff_multiplier,
            self.backoff_max,
        ];
        if rates.iter().any(|value| !value.is_finite()) {
            return Err("penalty and backoff settings must be finite".to_string());
        }
        if !(self.backoff_base > 0.0)
            || !(self.backoff_multiplier >= 1.0)
            || !(self.backoff_max >= self.backoff_base)
        {
            return Err("backoff must satisfy 0 < base <= max and multiplier >= 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for TierProfile {
    fn default() -> Self {
        Self::for_tier(VerificationTier::default())
    }
}
