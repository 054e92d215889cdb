//! Configuration for the lock manager and the ticket pool.
//!
//! Both structs deserialize with defaults for missing fields, so a config
//! file only needs to name what it overrides. Call `validate()` (the
//! constructors do) before use.

use std::time::Duration;

use fslock_error::{LockError, Result};
use serde::{Deserialize, Serialize};

/// Default number of concurrently admitted operations.
pub const DEFAULT_TICKET_CAPACITY: usize = 128;

/// Waits longer than this are logged at WARN.
pub const DEFAULT_SLOW_WAIT_THRESHOLD_MS: u64 = 1_000;

/// Configuration for [`LockManager`](crate::LockManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Acquisitions that waited longer than this many milliseconds are
    /// reported at WARN level.
    pub slow_wait_threshold_ms: u64,
    /// Database names longer than this many bytes are rejected. Names are
    /// free-form and unlimited when unset.
    pub max_database_name_len: Option<usize>,
}

impl LockManagerConfig {
    /// Check every field against its legal domain.
    pub fn validate(&self) -> Result<()> {
        if self.max_database_name_len == Some(0) {
            return Err(LockError::invalid_config(
                "max_database_name_len",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn slow_wait_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_wait_threshold_ms)
    }
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            slow_wait_threshold_ms: DEFAULT_SLOW_WAIT_THRESHOLD_MS,
            max_database_name_len: None,
        }
    }
}

/// Configuration for [`TicketHolder`](crate::TicketHolder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketHolderConfig {
    /// Fixed number of tickets; must be positive.
    pub capacity: usize,
}

impl TicketHolderConfig {
    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Check every field against its legal domain.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(LockError::invalid_config("capacity", "must be positive"));
        }
        Ok(())
    }
}

impl Default for TicketHolderConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_TICKET_CAPACITY,
        }
    }
}
