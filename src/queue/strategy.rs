//! Scheduling strategies for the request queue.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::Priority;

const LEVELS: usize = Priority::ALL.len();

/// Default credit weights, most urgent level first.
pub const DEFAULT_WEIGHTS: [f64; LEVELS] = [10.0, 5.0, 2.0, 1.0, 0.5];

/// How the next request is picked from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Oldest request first, regardless of priority.
    Fifo,
    /// Most urgent non-empty level first, oldest first within a level.
    #[default]
    PriorityFifo,
    /// Levels served in proportion to their credit weights.
    WeightedFair,
    /// Weighted-fair, with each level temporarily boosted by its share of the backlog.
    Adaptive,
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulingStrategy::Fifo => "fifo",
            SchedulingStrategy::PriorityFifo => "priority_fifo",
            SchedulingStrategy::WeightedFair => "weighted_fair",
            SchedulingStrategy::Adaptive => "adaptive",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(SchedulingStrategy::Fifo),
            "priority_fifo" | "priority" => Ok(SchedulingStrategy::PriorityFifo),
            "weighted_fair" | "weighted" => Ok(SchedulingStrategy::WeightedFair),
            "adaptive" => Ok(SchedulingStrategy::Adaptive),
            other => Err(format!("Invalid scheduling strategy: {}", other)),
        }
    }
}

/// Per-level credits for weighted-fair selection.
///
/// Smooth weighted round-robin: on every pick each non-empty level earns its weight
/// in credit, the level with the most credit wins and pays back the total weight of
/// the levels that competed. Over time each level is served in proportion to its
/// weight while it has work queued.
#[derive(Debug, Clone)]
pub struct WeightedCredits {
    weights: [f64; LEVELS],
    credits: [f64; LEVELS],
}

impl WeightedCredits {
    /// Create credits with the given weights, most urgent level first.
    pub fn new(weights: [f64; LEVELS]) -> Self {
        Self {
            weights,
            credits: [0.0; LEVELS],
        }
    }

    /// Pick a level given the current depth of each level.
    ///
    /// With `adaptive` set, each level's credit is boosted for this pick only by its
    /// share of the queued requests, scaled by the sum of all weights. Ties go to the
    /// more urgent level. Returns `None` if every level is empty.
    pub fn select(&mut self, depths: &[usize; LEVELS], adaptive: bool) -> Option<usize> {
        let total_depth: usize = depths.iter().sum();
        if total_depth == 0 {
            return None;
        }
        let total_weight: f64 = self.weights.iter().sum();

        let mut active_weight = 0.0;
        let mut chosen: Option<(usize, f64)> = None;
        for level in (0..LEVELS).filter(|&l| depths[l] > 0) {
            self.credits[level] += self.weights[level];
            active_weight += self.weights[level];

            let boost = if adaptive {
                depths[level] as f64 / total_depth as f64 * total_weight
            } else {
                0.0
            };
            let effective = self.credits[level] + boost;
            if chosen.is_none_or(|(_, best)| effective > best) {
                chosen = Some((level, effective));
            }
        }

        let (level, _) = chosen?;
        self.credits[level] -= active_weight;
        Some(level)
    }

    /// Current credit of each level.
    pub fn credits(&self) -> [f64; LEVELS] {
        self.credits
    }

    /// Configured weights.
    pub fn weights(&self) -> [f64; LEVELS] {
        self.weights
    }

    /// Reset all credits to zero.
    pub fn reset(&mut self) {
        self.credits = [0.0; LEVELS];
    }
}

impl Default for WeightedCredits {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "priority-fifo".parse::<SchedulingStrategy>().unwrap(),
            SchedulingStrategy::PriorityFifo
        );
        assert_eq!(
            "Weighted_Fair".parse::<SchedulingStrategy>().unwrap(),
            SchedulingStrategy::WeightedFair
        );
        assert!("random".parse::<SchedulingStrategy>().is_err());
    }

    #[test]
    fn test_select_empty() {
        let mut credits = WeightedCredits::default();
        assert_eq!(credits.select(&[0; LEVELS], false), None);
    }

    #[test]
    fn test_service_proportional_to_weights() {
        let mut credits = WeightedCredits::new([4.0, 2.0, 1.0, 1.0, 0.0]);
        let depths = [100, 100, 100, 100, 0];
        let mut served = [0usize; LEVELS];
        for _ in 0..80 {
            let level = credits.select(&depths, false).unwrap();
            served[level] += 1;
        }
        assert_eq!(served, [40, 20, 10, 10, 0]);
    }

    #[test]
    fn test_only_non_empty_levels_selected() {
        let mut credits = WeightedCredits::default();
        let depths = [0, 0, 0, 3, 0];
        for _ in 0..5 {
            assert_eq!(credits.select(&depths, false), Some(3));
        }
    }

    #[test]
    fn test_low_weight_level_not_starved() {
        let mut credits = WeightedCredits::default();
        let depths = [50, 0, 0, 0, 50];
        let picks: Vec<usize> = (0..21).map(|_| credits.select(&depths, false).unwrap()).collect();
        assert!(picks.contains(&4));
        assert_eq!(picks.iter().filter(|&&l| l == 0).count(), 20);
    }

    #[test]
    fn test_adaptive_boosts_backlog() {
        let depths = [0, 1, 0, 20, 0];

        let mut fair = WeightedCredits::default();
        assert_eq!(fair.select(&depths, false), Some(1));

        let mut adaptive = WeightedCredits::default();
        assert_eq!(adaptive.select(&depths, true), Some(3));
    }
}
