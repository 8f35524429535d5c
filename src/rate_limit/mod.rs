//! Rate limiting for Kraken API.
//!
//! Kraken has strict rate limits that vary by endpoint type and verification tier.
//! This module decides, for each outgoing call, whether it may proceed now.
//!
//! ## Rate Limit Gates
//!
//! Every call passes four gates in a fixed order, failing fast:
//!
//! 1. **Circuit breaker**: refuses everything while open
//! 2. **Penalty budget**: global decaying point counter per API key, including the
//!    surcharge for amending, editing or cancelling young orders
//! 3. **Token bucket**: per-category burst limit
//! 4. **Sliding window**: per-category exact per-minute ceiling
//!
//! Tokens taken at gate 3 are refunded when gate 4 denies.
//!
//! ## Example
//!
//! ```rust
//! use kraken_rate_limiter::rate_limit::{RateLimitConfig, RateLimiter, RequestOptions};
//! use kraken_rate_limiter::types::VerificationTier;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(RateLimitConfig::with_tier(VerificationTier::Pro));
//!
//! let decision = limiter.check_rate_limit("AddOrder", &RequestOptions::default()).await;
//! assert!(decision.allowed);
//! # }
//! ```
//!
//! ## Low-Level Primitives
//!
//! The gates are also usable on their own. They take the current instant
//! explicitly, so they never read the clock themselves:
//!
//! ```rust
//! use kraken_rate_limiter::rate_limit::{PenaltyTracker, TokenBucket};
//! use tokio::time::Instant;
//!
//! let now = Instant::now();
//! let mut bucket = TokenBucket::per_minute(15, now);
//! assert!(bucket.consume(1.0, now));
//!
//! let mut tracker = PenaltyTracker::new(20.0, 0.5, now);
//! assert!(tracker.can_add(8.0, now));
//! ```

mod breaker;
mod bucket;
mod config;
mod limiter;
mod orders;
mod penalty;
mod persistence;
mod profile;
mod status;
mod window;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use bucket::TokenBucket;
pub use config::{RateLimitConfig, RateLimitConfigBuilder};
pub use limiter::{RateLimitDecision, RateLimiter, RequestOptions};
pub use orders::OrderAgeRegistry;
pub use penalty::{AgePenaltyKind, PenaltyTracker, age_penalty};
pub use persistence::{PersistedState, SNAPSHOT_VERSION, snapshot_path};
pub use profile::TierProfile;
pub use status::{BreakerStatus, CategoryStatus, LimiterStats, PenaltyStatus, RateLimitStatus};
pub use window::SlidingWindow;

/// Rate limit constants by verification tier.
pub mod limits {
    /// Public endpoint requests per minute, all tiers.
    pub const PUBLIC_LIMIT: u32 = 60;

    /// Starter tier limits.
    pub mod starter {
        /// Private endpoint requests per minute.
        pub const PRIVATE_LIMIT: u32 = 10;
        /// Maximum API counter value.
        pub const MAX_COUNTER: u32 = 15;
        /// Counter decay rate per second.
        pub const DECAY_RATE: f64 = 0.33;
    }

    /// Intermediate tier limits.
    pub mod intermediate {
        /// Private endpoint requests per minute.
        pub const PRIVATE_LIMIT: u32 = 15;
        /// Maximum API counter value.
        pub const MAX_COUNTER: u32 = 20;
        /// Counter decay rate per second.
        pub const DECAY_RATE: f64 = 0.5;
    }

    /// Pro tier limits.
    pub mod pro {
        /// Private endpoint requests per minute.
        pub const PRIVATE_LIMIT: u32 = 20;
        /// Maximum API counter value.
        pub const MAX_COUNTER: u32 = 20;
        /// Counter decay rate per second.
        pub const DECAY_RATE: f64 = 1.0;
    }

    /// Order age surcharges.
    ///
    /// Each schedule is a list of `(age_below_secs, points)` steps; the first step
    /// whose bound exceeds the order's age applies, and ages past the last bound
    /// cost nothing.
    pub mod trading {
        /// Amend surcharge.
        pub const AMEND_SCHEDULE: [(u64, u32); 3] = [(5, 3), (10, 2), (15, 1)];
        /// Edit surcharge.
        pub const EDIT_SCHEDULE: [(u64, u32); 5] = [(5, 6), (10, 5), (15, 4), (45, 2), (90, 1)];
        /// Cancel surcharge.
        pub const CANCEL_SCHEDULE: [(u64, u32); 6] =
            [(5, 8), (10, 6), (15, 5), (45, 4), (90, 2), (300, 1)];
    }
}
