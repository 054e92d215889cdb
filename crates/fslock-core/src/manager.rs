//! Resource registry and owner allocation for the lock hierarchy.
//!
//! The manager owns one [`UpgradableRwLock`] for the global resource and
//! creates one per database name on first reference. Database locks are
//! never removed; callers can keep referring to a name for the lifetime of
//! the manager and always hit the same primitive.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fslock_error::{LockError, Result};
use fslock_types::{LockMode, OwnerToken, ResourceId};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::LockManagerConfig;
use crate::locker::Locker;
use crate::rw_lock::UpgradableRwLock;

/// Shared entry point for the Global/Database lock hierarchy.
///
/// Always handed out as `Arc<LockManager>`; every [`Locker`] keeps a clone.
pub struct LockManager {
    config: LockManagerConfig,
    global: Arc<UpgradableRwLock>,
    databases: RwLock<HashMap<Arc<str>, Arc<UpgradableRwLock>>>,
    next_owner: AtomicU64,
}

impl LockManager {
    /// Build a manager from a validated configuration.
    pub fn new(config: LockManagerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            slow_wait_threshold_ms = config.slow_wait_threshold_ms,
            max_database_name_len = ?config.max_database_name_len,
            "lock manager created"
        );
        Ok(Arc::new(Self::from_validated(config)))
    }

    /// Manager with [`LockManagerConfig::default`].
    #[must_use]
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Self::from_validated(LockManagerConfig::default()))
    }

    fn from_validated(config: LockManagerConfig) -> Self {
        Self {
            global: Arc::new(UpgradableRwLock::with_slow_wait_threshold(
                "global",
                config.slow_wait_threshold(),
            )),
            config,
            databases: RwLock::new(HashMap::new()),
            next_owner: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Allocate a fresh owner identity. Never returns the same token twice
    /// for one manager.
    #[must_use]
    pub fn alloc_owner(&self) -> OwnerToken {
        loop {
            let raw = self.next_owner.fetch_add(1, Ordering::Relaxed);
            // Zero only shows up after wrapping around.
            if let Some(owner) = OwnerToken::new(raw) {
                return owner;
            }
        }
    }

    /// A new, empty [`Locker`] with a freshly allocated owner.
    #[must_use]
    pub fn locker(self: &Arc<Self>) -> Locker {
        let owner = self.alloc_owner();
        Locker::new(Arc::clone(self), owner)
    }

    /// A new, empty [`Locker`] acting on behalf of `owner`.
    ///
    /// Two lockers must not share an owner while both hold locks: the
    /// primitives would treat them as one holder.
    #[must_use]
    pub fn locker_with_owner(self: &Arc<Self>, owner: OwnerToken) -> Locker {
        Locker::new(Arc::clone(self), owner)
    }

    /// The primitive behind `resource`, creating a database lock on first use.
    #[must_use]
    pub fn lock_for(&self, resource: &ResourceId) -> Arc<UpgradableRwLock> {
        match resource {
            ResourceId::Global => Arc::clone(&self.global),
            ResourceId::Database(name) => self.database_lock(name),
        }
    }

    fn database_lock(&self, name: &Arc<str>) -> Arc<UpgradableRwLock> {
        if let Some(lock) = self.databases.read().get(name) {
            return Arc::clone(lock);
        }
        let mut databases = self.databases.write();
        let lock = databases.entry(Arc::clone(name)).or_insert_with(|| {
            debug!(database = %name, "registered database lock");
            Arc::new(UpgradableRwLock::with_slow_wait_threshold(
                format!("db:{name}"),
                self.config.slow_wait_threshold(),
            ))
        });
        Arc::clone(lock)
    }

    /// Database names are free-form; the only check is the optional
    /// `max_database_name_len` limit.
    pub fn validate_database_name(&self, name: &str) -> Result<()> {
        match self.config.max_database_name_len {
            Some(limit) if name.len() > limit => Err(LockError::InvalidResourceName {
                name: name.to_owned(),
                reason: "name exceeds the configured maximum length",
            }),
            _ => Ok(()),
        }
    }

    /// Names of every database referenced so far, sorted.
    #[must_use]
    pub fn database_names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self.databases.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn database_count(&self) -> usize {
        self.databases.read().len()
    }

    /// Probe whether `resource` could be locked exclusively right now by an
    /// unrelated owner, waiting at most `timeout`.
    ///
    /// On success the probe lock is released again before returning, so this
    /// only answers "was it free"; it never keeps anything held.
    pub fn try_lock_exclusive_probe(&self, resource: &ResourceId, timeout: Duration) -> Result<()> {
        let lock = self.lock_for(resource);
        let owner = self.alloc_owner();
        lock.try_acquire_exclusive(owner, timeout)?;
        lock.release(owner, LockMode::Exclusive);
        Ok(())
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("databases", &self.database_count())
            .finish_non_exhaustive()
    }
}
