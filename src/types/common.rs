//! Common domain types for rate limiting.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Verification tier for rate limiting purposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationTier {
    /// Starter tier (lowest limits)
    #[default]
    Starter,
    /// Intermediate tier
    Intermediate,
    /// Pro tier (highest limits)
    Pro,
}

impl std::fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationTier::Starter => write!(f, "starter"),
            VerificationTier::Intermediate => write!(f, "intermediate"),
            VerificationTier::Pro => write!(f, "pro"),
        }
    }
}

impl FromStr for VerificationTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starter" => Ok(VerificationTier::Starter),
            "intermediate" => Ok(VerificationTier::Intermediate),
            "pro" => Ok(VerificationTier::Pro),
            other => Err(format!("Invalid verification tier: {}", other)),
        }
    }
}

/// Endpoint category. Each category has its own token bucket and sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointCategory {
    /// Public market data endpoints (limited by IP)
    Public,
    /// Private account and trading endpoints (limited by API key)
    Private,
}

impl EndpointCategory {
    /// All categories, in index order.
    pub const ALL: [EndpointCategory; 2] = [EndpointCategory::Public, EndpointCategory::Private];

    pub(crate) fn index(self) -> usize {
        match self {
            EndpointCategory::Public => 0,
            EndpointCategory::Private => 1,
        }
    }
}

impl std::fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointCategory::Public => write!(f, "public"),
            EndpointCategory::Private => write!(f, "private"),
        }
    }
}

/// Request priority, most urgent first.
///
/// The derived ordering follows urgency: `Critical < High < ... < Background`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Risk-reducing actions (cancels, emergency flattening)
    Critical,
    /// Order placement and amendments
    High,
    /// Regular account queries
    #[default]
    Normal,
    /// Reporting and history
    Low,
    /// Anything that can wait indefinitely
    Background,
}

impl Priority {
    /// All levels, most urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        };
        write!(f, "{}", s)
    }
}

/// The gate that denied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Circuit breaker is open
    CircuitOpen,
    /// Penalty point budget would be exceeded
    PenaltyBudgetExceeded,
    /// Category token bucket has too few tokens
    TokenBucketEmpty,
    /// Category sliding window is full
    SlidingWindowFull,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenyReason::CircuitOpen => "circuit open",
            DenyReason::PenaltyBudgetExceeded => "penalty budget exceeded",
            DenyReason::TokenBucketEmpty => "token bucket empty",
            DenyReason::SlidingWindowFull => "sliding window full",
        };
        write!(f, "{}", s)
    }
}
