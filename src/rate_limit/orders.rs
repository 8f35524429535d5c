//! Order creation times for age surcharge calculation.
//!
//! Timestamps are wall-clock (`OffsetDateTime`) rather than monotonic so the
//! registry can be persisted and still mean something after a restart.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use kraken_rate_limiter::rate_limit::OrderAgeRegistry;
//! use time::OffsetDateTime;
//!
//! let mut orders = OrderAgeRegistry::new(Duration::from_secs(3600));
//! let now = OffsetDateTime::now_utc();
//!
//! orders.record("O123", now - time::Duration::seconds(3));
//! assert_eq!(orders.age("O123", now), Some(Duration::from_secs(3)));
//!
//! orders.remove("O123");
//! assert!(orders.age("O123", now).is_none());
//! ```

use std::collections::HashMap;
use std::time::Duration;

use time::OffsetDateTime;

/// Registry size above which [`OrderAgeRegistry::record`] purges stale entries.
const OPPORTUNISTIC_PURGE_THRESHOLD: usize = 1024;

/// Order ID to creation time map with a retention ceiling.
#[derive(Debug, Clone)]
pub struct OrderAgeRegistry {
    orders: HashMap<String, OffsetDateTime>,
    retention: Duration,
}

impl OrderAgeRegistry {
    /// Create an empty registry. Entries older than `retention` are dropped on purge.
    pub fn new(retention: Duration) -> Self {
        Self {
            orders: HashMap::new(),
            retention,
        }
    }

    /// Record when an order was created.
    pub fn record(&mut self, order_id: impl Into<String>, created_at: OffsetDateTime) {
        if self.orders.len() >= OPPORTUNISTIC_PURGE_THRESHOLD {
            self.purge(OffsetDateTime::now_utc());
        }
        self.orders.insert(order_id.into(), created_at);
    }

    /// Age of an order at `now`.
    ///
    /// Returns `None` if the order is unknown or older than the retention period.
    /// Creation times in the future count as age zero.
    pub fn age(&self, order_id: &str, now: OffsetDateTime) -> Option<Duration> {
        let created_at = self.orders.get(order_id)?;
        let age = age_between(*created_at, now);
        (age < self.retention).then_some(age)
    }

    /// Creation time of an order, if tracked.
    pub fn created_at(&self, order_id: &str) -> Option<OffsetDateTime> {
        self.orders.get(order_id).copied()
    }

    /// Forget an order. Returns its creation time if it was tracked.
    pub fn remove(&mut self, order_id: &str) -> Option<OffsetDateTime> {
        self.orders.remove(order_id)
    }

    /// Drop entries older than the retention period. Returns how many were removed.
    pub fn purge(&mut self, now: OffsetDateTime) -> usize {
        let before = self.orders.len();
        let retention = self.retention;
        self.orders
            .retain(|_, created_at| age_between(*created_at, now) < retention);
        let removed = before - self.orders.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.orders.len(), "Purged stale order times");
        }
        removed
    }

    /// Get the number of tracked orders.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Check if no orders are tracked.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Iterate over tracked orders.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &OffsetDateTime)> {
        self.orders.iter()
    }

    /// Retention period.
    pub fn retention(&self) -> Duration {
        self.retention
    }
}

impl Default for OrderAgeRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

fn age_between(created_at: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let elapsed = now - created_at;
    if elapsed.is_negative() {
        Duration::ZERO
    } else {
        elapsed.unsigned_abs()
    }
}
