//! Token bucket for per-category burst control.

use std::time::Duration;

use tokio::time::Instant;

/// Token bucket with lazy refill.
///
/// Tokens refill continuously at `refill_rate` per second up to `capacity`. Refill is
/// computed on access, so the bucket needs no background task.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Current token count
    tokens: f64,
    /// Last time tokens were refilled
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of tokens (burst size)
    /// * `refill_rate` - Tokens added per second
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Create a bucket that refills its full capacity once per minute.
    pub fn per_minute(limit: u32, now: Instant) -> Self {
        Self::new(limit, limit as f64 / 60.0, now)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    /// Take `n` tokens if available.
    ///
    /// Returns `false` and leaves the bucket unchanged if there are not enough tokens.
    pub fn consume(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Give back `n` tokens taken by [`consume`](Self::consume), capped at capacity.
    pub fn refund(&mut self, n: f64, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + n).min(self.capacity);
    }

    /// Time until `n` tokens are available. Zero if they already are.
    pub fn time_until_available(&mut self, n: f64, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= n {
            Duration::ZERO
        } else if self.refill_rate <= 0.0 {
            Duration::MAX
        } else {
            Duration::try_from_secs_f64((n - self.tokens) / self.refill_rate).unwrap_or(Duration::MAX)
        }
    }

    /// Tokens available at `now`, without mutating the bucket.
    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_until_empty() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(3, 1.0, t0);

        assert!(bucket.consume(1.0, t0));
        assert!(bucket.consume(2.0, t0));
        assert!(!bucket.consume(1.0, t0));
        assert_eq!(bucket.available(t0), 0.0);
    }

    #[test]
    fn test_failed_consume_leaves_tokens() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(2, 1.0, t0);

        assert!(!bucket.consume(3.0, t0));
        assert_eq!(bucket.available(t0), 2.0);
    }

    #[test]
    fn test_lazy_refill_capped() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(10, 2.0, t0);
        assert!(bucket.consume(10.0, t0));

        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(bucket.available(t1), 4.0);

        let t2 = t0 + Duration::from_secs(60);
        assert_eq!(bucket.available(t2), 10.0);
        assert!(bucket.consume(10.0, t2));
    }

    #[test]
    fn test_refund_capped_at_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(5, 1.0, t0);

        assert!(bucket.consume(2.0, t0));
        bucket.refund(2.0, t0);
        assert_eq!(bucket.available(t0), 5.0);

        bucket.refund(10.0, t0);
        assert_eq!(bucket.available(t0), 5.0);
    }

    #[test]
    fn test_time_until_available() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(4, 0.5, t0);

        assert_eq!(bucket.time_until_available(1.0, t0), Duration::ZERO);
        assert!(bucket.consume(4.0, t0));
        assert_eq!(bucket.time_until_available(1.0, t0), Duration::from_secs(2));
        assert_eq!(bucket.time_until_available(2.0, t0), Duration::from_secs(4));
    }

    #[test]
    fn test_per_minute_rate() {
        let t0 = Instant::now();
        let bucket = TokenBucket::per_minute(15, t0);
        assert_eq!(bucket.capacity(), 15.0);
        assert!((bucket.refill_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tokens_never_negative_or_above_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(3, 10.0, t0);
        for i in 0..50u64 {
            let now = t0 + Duration::from_millis(i * 37);
            bucket.consume(1.0, now);
            let available = bucket.available(now);
            assert!((0.0..=3.0).contains(&available));
        }
    }
}
