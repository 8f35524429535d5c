//! Penalty point budget and order age surcharges.
//!
//! Kraken charges every private call penalty points against a per-key budget that
//! decays continuously. Amending, editing or cancelling an order shortly after it
//! was placed costs extra, and the surcharge shrinks as the order ages.
//!
//! # Surcharge Schedule
//!
//! | Order Age | Amend | Edit | Cancel |
//! |-----------|-------|------|--------|
//! | < 5s      | 3     | 6    | 8      |
//! | 5-10s     | 2     | 5    | 6      |
//! | 10-15s    | 1     | 4    | 5      |
//! | 15-45s    | 0     | 2    | 4      |
//! | 45-90s    | 0     | 1    | 2      |
//! | 90-300s   | 0     | 0    | 1      |
//! | >= 300s   | 0     | 0    | 0      |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::rate_limit::limits::trading;

/// Kind of order modification subject to an age surcharge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgePenaltyKind {
    /// Amend an order in place
    Amend,
    /// Edit (replace) an order
    Edit,
    /// Cancel an order
    Cancel,
}

/// Extra penalty points for modifying an order of the given age.
pub fn age_penalty(kind: AgePenaltyKind, age: Duration) -> f64 {
    let schedule: &[(u64, u32)] = match kind {
        AgePenaltyKind::Amend => &trading::AMEND_SCHEDULE,
        AgePenaltyKind::Edit => &trading::EDIT_SCHEDULE,
        AgePenaltyKind::Cancel => &trading::CANCEL_SCHEDULE,
    };
    let secs = age.as_secs_f64();
    schedule
        .iter()
        .find(|(below, _)| secs < *below as f64)
        .map_or(0.0, |(_, points)| *points as f64)
}

/// Global decaying penalty point budget.
#[derive(Debug, Clone)]
pub struct PenaltyTracker {
    /// Budget ceiling
    max_points: f64,
    /// Points removed per second
    decay_rate: f64,
    /// Current points
    points: f64,
    /// Last time decay was applied
    last_update: Instant,
}

impl PenaltyTracker {
    /// Create an empty tracker.
    ///
    /// # Arguments
    ///
    /// * `max_points` - Maximum penalty points before calls are refused
    /// * `decay_rate` - How many points decay per second
    pub fn new(max_points: f64, decay_rate: f64, now: Instant) -> Self {
        Self {
            max_points,
            decay_rate,
            points: 0.0,
            last_update: now,
        }
    }

    /// Apply decay for the time elapsed since the last update.
    pub fn decay(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.points = (self.points - elapsed * self.decay_rate).max(0.0);
        self.last_update = self.last_update.max(now);
    }

    /// Check if `points` more fit in the budget.
    pub fn can_add(&mut self, points: f64, now: Instant) -> bool {
        self.decay(now);
        self.points + points <= self.max_points
    }

    /// Charge `points`, clamped to the budget ceiling.
    pub fn add(&mut self, points: f64, now: Instant) {
        self.decay(now);
        self.points = (self.points + points).clamp(0.0, self.max_points);
    }

    /// Time until `points` more fit in the budget. Zero if they already do.
    pub fn time_until_available(&mut self, points: f64, now: Instant) -> Duration {
        self.decay(now);
        let excess = self.points + points - self.max_points;
        if excess <= 0.0 {
            Duration::ZERO
        } else if self.decay_rate <= 0.0 {
            Duration::MAX
        } else {
            Duration::try_from_secs_f64(excess / self.decay_rate).unwrap_or(Duration::MAX)
        }
    }

    /// Restore points saved `elapsed` ago, applying the decay that happened meanwhile.
    pub fn restore(&mut self, saved_points: f64, elapsed: Duration, now: Instant) {
        let decayed = saved_points - elapsed.as_secs_f64() * self.decay_rate;
        self.points = decayed.clamp(0.0, self.max_points);
        self.last_update = now;
    }

    /// Current points at `now`, without mutating the tracker.
    pub fn current(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        (self.points - elapsed * self.decay_rate).max(0.0)
    }

    /// Budget ceiling.
    pub fn max_points(&self) -> f64 {
        self.max_points
    }

    /// Points decayed per second.
    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    /// Fraction of the budget in use at `now`.
    pub fn utilization(&self, now: Instant) -> f64 {
        if self.max_points <= 0.0 {
            return 1.0;
        }
        self.current(now) / self.max_points
    }
}
