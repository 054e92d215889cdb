//! Concurrency-control core: hierarchical lock manager and ticket admission.
//!
//! - [`UpgradableRwLock`]: owner-aware reader/writer lock with an
//!   intermediate Upgradable mode, greedy writers and bounded probes.
//! - [`LockManager`] + [`Locker`]: the Global/Database hierarchy, per-operation
//!   lock stacks with recursion, scoped guards and temporary release.
//! - [`TicketHolder`]: bounded FIFO counting semaphore for admission control.
//!
//! Caller defects (releasing what is not held, double ticket release,
//! diverged restores) panic; contention outcomes are [`LockError`]s.

pub mod config;
pub mod locker;
pub mod manager;
pub mod metrics;
pub mod rw_lock;
pub mod ticket;

pub use config::{LockManagerConfig, TicketHolderConfig};
pub use fslock_error::{LockError, Result};
pub use fslock_types::{LockEntry, LockMode, OwnerToken, ResourceId, ResourceKind};
pub use locker::{LockSnapshot, Locker, ScopedLock, TempRelease};
pub use manager::LockManager;
pub use metrics::{
    LockMetrics, TicketMetrics, lock_metrics, reset_lock_metrics, reset_ticket_metrics,
    ticket_metrics,
};
pub use rw_lock::{RwLockState, UpgradableRwLock};
pub use ticket::{Ticket, TicketHolder};

/// Report a broken locking invariant and abort the current operation.
///
/// These are caller-side logic defects, never retryable conditions.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(detail: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(%detail, "lock invariant violated");
    panic!("lock invariant violated: {detail}");
}
