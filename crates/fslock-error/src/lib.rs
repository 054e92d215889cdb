use std::time::Duration;

use thiserror::Error;

/// Primary error type for fslock operations.
///
/// Only *recoverable* outcomes are represented here: contention timeouts,
/// exhausted ticket pools, upgrade conflicts and configuration mistakes.
/// Invariant violations (releasing something that is not held, releasing a
/// ticket twice, restoring a diverged snapshot) are caller defects and abort
/// the operation with a panic instead of surfacing as a `LockError`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    // === Contention ===
    /// A bounded lock probe gave up before the lock became available.
    #[error("timed out after {waited:?} waiting for {mode} lock on {resource}")]
    Timeout {
        resource: String,
        mode: &'static str,
        waited: Duration,
    },

    /// Granting the request would deadlock: the requester holds the lock in
    /// shared mode while another owner is already waiting to upgrade.
    #[error("upgrade conflict on {resource}: owner {owner} holds shared while another upgrade is pending")]
    UpgradeConflict { resource: String, owner: u64 },

    /// A database name exceeded the configured length limit and was
    /// rejected before any lock was touched.
    #[error("invalid database name {name:?}: {reason}")]
    InvalidResourceName { name: String, reason: &'static str },

    // === Admission control ===
    /// Non-blocking ticket acquisition found the pool at capacity.
    #[error("no tickets available (capacity {capacity})")]
    TicketsExhausted { capacity: usize },

    /// Bounded ticket wait expired.
    #[error("timed out after {waited:?} waiting for a ticket (capacity {capacity})")]
    TicketTimeout { capacity: usize, waited: Duration },

    // === Configuration ===
    /// A configuration value is out of its legal domain.
    #[error("invalid configuration for `{field}`: {detail}")]
    InvalidConfig { field: &'static str, detail: String },

    /// A process-wide singleton was installed twice.
    #[error("{what} is already initialized")]
    AlreadyInitialized { what: &'static str },
}

impl LockError {
    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::UpgradeConflict { .. }
                | Self::TicketsExhausted { .. }
                | Self::TicketTimeout { .. }
        )
    }

    /// Human-friendly suggestion for handling this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { .. } | Self::TicketTimeout { .. } => {
                Some("Back off and retry, or abort the operation")
            }
            Self::UpgradeConflict { .. } => {
                Some("Release the shared lock and retry the exclusive request from scratch")
            }
            Self::TicketsExhausted { .. } => Some("Wait for a ticket instead of probing"),
            Self::InvalidConfig { .. } => Some("Fix the configuration value and restart"),
            Self::InvalidResourceName { .. } => {
                Some("Use a shorter database name or raise max_database_name_len")
            }
            Self::AlreadyInitialized { .. } => None,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(field: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            detail: detail.into(),
        }
    }
}

/// Result type alias using `LockError`.
pub type Result<T> = std::result::Result<T, LockError>;
