//! Occupancy tracking for admission-bound tests.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts how many workers are inside a region and remembers the peak.
#[derive(Debug, Default)]
pub struct HighWaterGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl HighWaterGauge {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        }
    }

    /// Enter the region; returns the occupancy including the caller.
    pub fn check_in(&self) -> usize {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        now
    }

    /// Leave the region.
    pub fn check_out(&self) {
        let previous = self.current.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "check_out without matching check_in");
    }

    /// RAII form of `check_in` / `check_out`.
    pub fn enter(&self) -> GaugeGuard<'_> {
        let occupancy = self.check_in();
        GaugeGuard {
            gauge: self,
            occupancy,
        }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest occupancy seen so far.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Holds one slot of a [`HighWaterGauge`].
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a HighWaterGauge,
    occupancy: usize,
}

impl GaugeGuard<'_> {
    /// Occupancy observed when this guard entered.
    #[must_use]
    pub const fn occupancy(&self) -> usize {
        self.occupancy
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.check_out();
    }
}
