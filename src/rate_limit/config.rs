//! Rate limiter configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::auth::CredentialId;
use crate::error::RateLimitError;
use crate::queue::QueueConfig;
use crate::rate_limit::{CircuitBreakerConfig, TierProfile};
use crate::types::VerificationTier;

/// Environment variable holding the verification tier.
pub const ENV_TIER: &str = "KRAKEN_TIER";
/// Environment variable holding the snapshot directory.
pub const ENV_STATE_DIR: &str = "KRAKEN_RATE_LIMIT_STATE_DIR";
/// Environment variable holding the API key used to key persisted state.
pub const ENV_API_KEY: &str = "KRAKEN_API_KEY";

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Verification tier (affects rate limits).
    pub tier: VerificationTier,
    /// Replaces the tier's built-in profile.
    pub profile: Option<TierProfile>,
    /// Identity that keys persisted state. `None` persists as "anonymous".
    pub credential: Option<CredentialId>,
    /// Whether to enable rate limiting. When disabled every check passes.
    pub enabled: bool,
    /// Route `acquire`/`execute` through the priority queue.
    pub enable_queue: bool,
    /// Run the circuit breaker gate.
    pub enable_circuit_breaker: bool,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Queue strategy and expiry.
    pub queue: QueueConfig,
    /// Directory for state snapshots. `None` disables persistence.
    pub state_dir: Option<PathBuf>,
    /// How often the background task writes a snapshot.
    pub persist_interval: Duration,
    /// How often stale order times are purged.
    pub cleanup_interval: Duration,
    /// Snapshots older than this are discarded on load.
    pub snapshot_max_age: Duration,
    /// How long tracked order times are kept.
    pub order_retention: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tier: VerificationTier::Starter,
            profile: None,
            credential: None,
            enabled: true,
            enable_queue: false,
            enable_circuit_breaker: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            queue: QueueConfig::default(),
            state_dir: None,
            persist_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            snapshot_max_age: Duration::from_secs(3600),
            order_retention: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    /// Default configuration for a tier.
    pub fn with_tier(tier: VerificationTier) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    /// Create a new configuration builder.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new()
    }

    /// Build a configuration from environment variables.
    ///
    /// Reads `KRAKEN_TIER`, `KRAKEN_RATE_LIMIT_STATE_DIR` and `KRAKEN_API_KEY`.
    /// Unset variables keep their defaults; an unparseable tier is an error.
    pub fn from_env() -> Result<Self, RateLimitError> {
        let mut config = Self::default();
        if let Ok(tier) = std::env::var(ENV_TIER) {
            config.tier = tier.parse().map_err(RateLimitError::InvalidConfig)?;
        }
        if let Some(dir) = std::env::var(ENV_STATE_DIR)
            .ok()
            .filter(|dir| !dir.trim().is_empty())
        {
            config.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = std::env::var(ENV_API_KEY).ok().filter(|key| !key.is_empty()) {
            config.credential = Some(CredentialId::from_api_key(&key));
        }
        Ok(config)
    }

    /// Profile in effect: the override if set, otherwise the tier's built-in one.
    pub fn effective_profile(&self) -> TierProfile {
        self.profile
            .clone()
            .unwrap_or_else(|| TierProfile::for_tier(self.tier))
    }

    /// Check the configuration for values the limiter cannot work with.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        self.effective_profile()
            .validate()
            .map_err(RateLimitError::InvalidConfig)?;
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            return Err(RateLimitError::InvalidConfig(
                "circuit breaker thresholds must be positive".to_string(),
            ));
        }
        if self.queue.capacity == Some(0) {
            return Err(RateLimitError::InvalidConfig(
                "queue capacity must be positive".to_string(),
            ));
        }
        if self.queue.weights.iter().any(|w| !(*w >= 0.0)) {
            return Err(RateLimitError::InvalidConfig(
                "queue weights must be non-negative".to_string(),
            ));
        }
        if self.persist_interval.is_zero()
            || self.cleanup_interval.is_zero()
            || self.queue.sweep_interval.is_zero()
        {
            return Err(RateLimitError::InvalidConfig(
                "background intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RateLimitConfig`].
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: RateLimitConfig::default(),
        }
    }

    /// Set the verification tier.
    pub fn tier(mut self, tier: VerificationTier) -> Self {
        self.config.tier = tier;
        self
    }

    /// Replace the tier's built-in limits.
    pub fn profile(mut self, profile: TierProfile) -> Self {
        self.config.profile = Some(profile);
        self
    }

    /// Set the identity that keys persisted state.
    pub fn credential(mut self, credential: CredentialId) -> Self {
        self.config.credential = Some(credential);
        self
    }

    /// Enable or disable rate limiting altogether.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Route `acquire`/`execute` through the priority queue.
    pub fn enable_queue(mut self, enable: bool) -> Self {
        self.config.enable_queue = enable;
        self
    }

    /// Enable or disable the circuit breaker gate.
    pub fn enable_circuit_breaker(mut self, enable: bool) -> Self {
        self.config.enable_circuit_breaker = enable;
        self
    }

    /// Set the circuit breaker thresholds.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set the queue configuration.
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    /// Persist state snapshots under `dir`.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = Some(dir.into());
        self
    }

    /// Set how often snapshots are written.
    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.config.persist_interval = interval;
        self
    }

    /// Set how often stale order times are purged.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Set the age past which snapshots are discarded.
    pub fn snapshot_max_age(mut self, max_age: Duration) -> Self {
        self.config.snapshot_max_age = max_age;
        self
    }

    /// Set how long order times are kept.
    pub fn order_retention(mut self, retention: Duration) -> Self {
        self.config.order_retention = retention;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}
