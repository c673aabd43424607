//! Two-tier memory horizon for time-shift retention

use log::debug;

use crate::assets::DEFAULT_CLEANUP_FRACTION;

/// What eviction does with an entry of a given age
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Younger than the soft horizon: keep a strong hold
    Retain,
    /// Between the soft and hard horizons: may be reclaimed at any time
    Soften,
    /// At or beyond the hard horizon: return to the pool and forget
    Drop,
}

/// Soft and hard horizons (in time points) plus the eviction throttle.
///
/// `soft <= hard` always holds; swapped inputs are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHorizon {
    soft: i64,
    hard: i64,
    cleanup_period: i64,
}

impl MemoryHorizon {
    /// Horizons with the cleanup period at the default fraction of the soft horizon
    pub fn new(soft: i64, hard: i64) -> Self {
        Self::with_cleanup_fraction(soft, hard, DEFAULT_CLEANUP_FRACTION)
    }

    pub fn with_cleanup_fraction(soft: i64, hard: i64, fraction: f64) -> Self {
        if soft > hard {
            debug!(
                "MemoryHorizon: soft horizon {} exceeds hard horizon {}, swapping",
                soft, hard
            );
        }
        let (soft, hard) = (soft.min(hard).max(0), soft.max(hard).max(0));
        let fraction = if fraction.is_finite() { fraction } else { 0.0 };
        let cleanup_period = ((soft as f64 * fraction) as i64).max(1);

        Self {
            soft,
            hard,
            cleanup_period,
        }
    }

    /// Override the derived cleanup period (clamped to at least one).
    pub fn with_cleanup_period(mut self, period: i64) -> Self {
        self.cleanup_period = period.max(1);
        self
    }

    pub fn soft(&self) -> i64 {
        self.soft
    }

    pub fn hard(&self) -> i64 {
        self.hard
    }

    pub fn cleanup_period(&self) -> i64 {
        self.cleanup_period
    }

    /// Eviction only runs on time indices that are a multiple of the period.
    pub fn is_cleanup_due(&self, trigger: i64) -> bool {
        trigger.rem_euclid(self.cleanup_period) == 0
    }

    pub fn classify(&self, newest: i64, key: i64) -> Retention {
        if key > newest.saturating_sub(self.soft) {
            Retention::Retain
        } else if key > newest.saturating_sub(self.hard) {
            Retention::Soften
        } else {
            Retention::Drop
        }
    }
}

impl Default for MemoryHorizon {
    fn default() -> Self {
        use crate::assets::{DEFAULT_HARD_HORIZON, DEFAULT_SOFT_HORIZON};
        Self::new(DEFAULT_SOFT_HORIZON, DEFAULT_HARD_HORIZON)
    }
}
