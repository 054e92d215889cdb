//! Lock-free process-wide counters for lock and ticket activity.
//!
//! Counters use `Relaxed` ordering; they are diagnostics, never used for
//! synchronization. Snapshots are `Serialize` so harnesses can dump them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Lock counters
// ---------------------------------------------------------------------------

static FSLOCK_ACQUISITIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_CONTENDED_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_TIMEOUTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_UPGRADES_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_UPGRADE_CONFLICTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_SLOW_WAITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_TEMP_RELEASES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of lock metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockMetrics {
    /// Primitive-level grants (any mode, including upgrades).
    pub fslock_acquisitions_total: u64,
    /// Grants that had to wait at least once.
    pub fslock_contended_total: u64,
    /// Bounded probes that expired.
    pub fslock_timeouts_total: u64,
    /// Completed Upgradable -> Exclusive transitions.
    pub fslock_upgrades_total: u64,
    /// Requests refused because they would deadlock against a pending upgrade.
    pub fslock_upgrade_conflicts_total: u64,
    /// Grants whose wait exceeded the slow-wait threshold.
    pub fslock_slow_waits_total: u64,
    /// Temporary releases performed by lockers.
    pub fslock_temp_releases_total: u64,
}

/// Read current lock metrics.
#[must_use]
pub fn lock_metrics() -> LockMetrics {
    LockMetrics {
        fslock_acquisitions_total: FSLOCK_ACQUISITIONS_TOTAL.load(Ordering::Relaxed),
        fslock_contended_total: FSLOCK_CONTENDED_TOTAL.load(Ordering::Relaxed),
        fslock_timeouts_total: FSLOCK_TIMEOUTS_TOTAL.load(Ordering::Relaxed),
        fslock_upgrades_total: FSLOCK_UPGRADES_TOTAL.load(Ordering::Relaxed),
        fslock_upgrade_conflicts_total: FSLOCK_UPGRADE_CONFLICTS_TOTAL.load(Ordering::Relaxed),
        fslock_slow_waits_total: FSLOCK_SLOW_WAITS_TOTAL.load(Ordering::Relaxed),
        fslock_temp_releases_total: FSLOCK_TEMP_RELEASES_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset lock metrics (for tests).
pub fn reset_lock_metrics() {
    FSLOCK_ACQUISITIONS_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_CONTENDED_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_TIMEOUTS_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_UPGRADES_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_UPGRADE_CONFLICTS_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_SLOW_WAITS_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_TEMP_RELEASES_TOTAL.store(0, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_acquisition(contended: bool) {
    FSLOCK_ACQUISITIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
    if contended {
        FSLOCK_CONTENDED_TOTAL.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub(crate) fn record_timeout() {
    FSLOCK_TIMEOUTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_upgrade() {
    FSLOCK_UPGRADES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_upgrade_conflict() {
    FSLOCK_UPGRADE_CONFLICTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_slow_wait() {
    FSLOCK_SLOW_WAITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_temp_release() {
    FSLOCK_TEMP_RELEASES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Ticket counters
// ---------------------------------------------------------------------------

static FSLOCK_TICKETS_ACQUIRED_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_TICKETS_WAITED_TOTAL: AtomicU64 = AtomicU64::new(0);
static FSLOCK_TICKETS_EXHAUSTED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of ticket metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TicketMetrics {
    pub fslock_tickets_acquired_total: u64,
    /// Acquisitions that queued behind a full pool.
    pub fslock_tickets_waited_total: u64,
    /// Non-blocking probes and bounded waits that came back empty-handed.
    pub fslock_tickets_exhausted_total: u64,
}

/// Read current ticket metrics.
#[must_use]
pub fn ticket_metrics() -> TicketMetrics {
    TicketMetrics {
        fslock_tickets_acquired_total: FSLOCK_TICKETS_ACQUIRED_TOTAL.load(Ordering::Relaxed),
        fslock_tickets_waited_total: FSLOCK_TICKETS_WAITED_TOTAL.load(Ordering::Relaxed),
        fslock_tickets_exhausted_total: FSLOCK_TICKETS_EXHAUSTED_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset ticket metrics (for tests).
pub fn reset_ticket_metrics() {
    FSLOCK_TICKETS_ACQUIRED_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_TICKETS_WAITED_TOTAL.store(0, Ordering::Relaxed);
    FSLOCK_TICKETS_EXHAUSTED_TOTAL.store(0, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_ticket_acquired(waited: bool) {
    FSLOCK_TICKETS_ACQUIRED_TOTAL.fetch_add(1, Ordering::Relaxed);
    if waited {
        FSLOCK_TICKETS_WAITED_TOTAL.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub(crate) fn record_ticket_exhausted() {
    FSLOCK_TICKETS_EXHAUSTED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are process-wide and other tests bump them concurrently, so
    // only monotonic growth is asserted here.
    #[test]
    fn test_counters_grow() {
        let before = lock_metrics();
        record_acquisition(true);
        record_timeout();
        let after = lock_metrics();
        assert!(after.fslock_acquisitions_total > before.fslock_acquisitions_total);
        assert!(after.fslock_contended_total > before.fslock_contended_total);
        assert!(after.fslock_timeouts_total > before.fslock_timeouts_total);

        let before = ticket_metrics();
        record_ticket_acquired(true);
        record_ticket_exhausted();
        let after = ticket_metrics();
        assert!(after.fslock_tickets_waited_total > before.fslock_tickets_waited_total);
        assert!(after.fslock_tickets_exhausted_total > before.fslock_tickets_exhausted_total);
    }

    #[test]
    fn test_metrics_serialize() {
        let json = serde_json::to_value(lock_metrics()).unwrap();
        assert!(json.get("fslock_upgrades_total").is_some());
        let json = serde_json::to_value(ticket_metrics()).unwrap();
        assert!(json.get("fslock_tickets_acquired_total").is_some());
    }
}
