//! Explore/exploit candidate selection.
//!
//! Most allocations take the top-scored worker. With probability
//! `exploration_rate`, the router instead samples among all candidates
//! weighted by score, so historical performance data keeps covering
//! workers that would otherwise never be chosen. Exploration only picks
//! among already-qualified candidates; it can never violate capacity or
//! capability invariants.

use rand::Rng;

/// Score-weighted ε-greedy selector.
#[derive(Debug, Clone)]
pub struct Router {
    exploration_rate: f64,
}

impl Router {
    pub fn new(exploration_rate: f64) -> Self {
        Self {
            exploration_rate: exploration_rate.clamp(0.0, 1.0),
        }
    }

    /// Pick an index into `scores` (descending-sorted by the caller).
    ///
    /// Returns 0 (exploit) unless this call explores; exploring samples
    /// proportionally to `score + 0.1` so even weak candidates keep a
    /// small probability mass.
    pub fn select_index(&self, scores: &[f64]) -> usize {
        if scores.len() < 2 {
            return 0;
        }

        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() >= self.exploration_rate {
            return 0;
        }

        let weights: Vec<f64> = scores.iter().map(|s| s.max(0.0) + 0.1).collect();
        let total: f64 = weights.iter().sum();
        let mut target = rng.gen::<f64>() * total;
        for (index, weight) in weights.iter().enumerate() {
            target -= weight;
            if target <= 0.0 {
                return index;
            }
        }
        scores.len() - 1
    }
}

// ── tests ────────────────────────────────────────────────────────────
