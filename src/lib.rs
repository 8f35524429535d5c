//! # Kraken Rate Limiter
//!
//! Admission control and request scheduling for clients of the Kraken exchange API.
//!
//! Kraken enforces several independent limits at once: a decaying penalty point
//! budget per API key, per-minute ceilings for public and private endpoints, and
//! extra penalties for amending, editing or cancelling an order shortly after it
//! was placed. This crate decides, for every outgoing call, whether it may proceed
//! now, how long to wait if not, and in which order waiting callers are released.
//!
//! ## Features
//!
//! - Token bucket, sliding window and penalty budget gates per endpoint category
//! - Order age surcharges for amend, edit and cancel
//! - Embedded circuit breaker
//! - Priority request queue with FIFO, priority, weighted-fair and adaptive strategies
//! - Penalty state persisted across restarts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kraken_rate_limiter::{RateLimitConfig, RateLimiter, RequestOptions, VerificationTier};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = RateLimiter::new(RateLimitConfig::with_tier(VerificationTier::Intermediate));
//!
//!     let decision = limiter.check_rate_limit("Balance", &RequestOptions::default()).await;
//!     println!("allowed: {}, wait: {:?}", decision.allowed, decision.wait);
//!
//!     let ok = limiter
//!         .wait_for_rate_limit("AddOrder", &RequestOptions::default())
//!         .await;
//!     println!("admitted: {ok}");
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod endpoints;
pub mod error;
pub mod queue;
pub mod rate_limit;
pub mod types;

// Re-export commonly used types at crate root
pub use error::RateLimitError;
pub use rate_limit::{
    RateLimitConfig, RateLimitDecision, RateLimitStatus, RateLimiter, RequestOptions,
};
pub use types::{EndpointCategory, Priority, VerificationTier};

/// Result type alias using RateLimitError
pub type Result<T> = std::result::Result<T, RateLimitError>;
