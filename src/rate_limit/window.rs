//! Sliding window request counter.
//!
//! Admission check and commit are separate calls: the orchestrator asks
//! [`SlidingWindow::can_admit`] while other gates are still being evaluated, and
//! only calls [`SlidingWindow::record`] once every gate has passed.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use kraken_rate_limiter::rate_limit::SlidingWindow;
//! use tokio::time::Instant;
//!
//! let now = Instant::now();
//! let mut window = SlidingWindow::new(Duration::from_secs(60), 2);
//!
//! assert!(window.can_admit(now));
//! window.record(now);
//! window.record(now);
//! assert!(!window.can_admit(now));
//! assert_eq!(window.time_until_available(now), Duration::from_secs(60));
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Exact count of requests within the last `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    /// Request timestamps, oldest first
    requests: VecDeque<Instant>,
    /// Window duration
    window: Duration,
    /// Maximum requests per window
    max_requests: u32,
}

impl SlidingWindow {
    /// Create a new sliding window.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            requests: VecDeque::with_capacity(max_requests as usize),
            window,
            max_requests,
        }
    }

    /// Create a one-minute window.
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(Duration::from_secs(60), max_requests)
    }

    /// Drop every timestamp at or before `now - window`.
    pub fn purge(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.requests.front().is_some_and(|ts| *ts <= cutoff) {
            self.requests.pop_front();
        }
    }

    /// Check whether one more request fits in the window.
    pub fn can_admit(&mut self, now: Instant) -> bool {
        self.purge(now);
        (self.requests.len() as u32) < self.max_requests
    }

    /// Record an admitted request.
    pub fn record(&mut self, now: Instant) {
        self.purge(now);
        // Keep ordering even if the caller's clock reading went backwards.
        let ts = self.requests.back().map_or(now, |last| now.max(*last));
        self.requests.push_back(ts);
    }

    /// Time until a request fits. Zero if one fits now.
    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        if self.can_admit(now) {
            return Duration::ZERO;
        }
        self.requests
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Requests currently counted (after purging).
    pub fn count(&mut self, now: Instant) -> u32 {
        self.purge(now);
        self.requests.len() as u32
    }

    /// Get the number of remaining permits.
    pub fn remaining(&mut self, now: Instant) -> u32 {
        self.max_requests.saturating_sub(self.count(now))
    }

    /// Maximum requests per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Oldest timestamp still held, if any.
    pub fn oldest(&self) -> Option<Instant> {
        self.requests.front().copied()
    }
}
