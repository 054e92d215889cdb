//! Owner-aware reader/writer lock with an Upgradable mode.
//!
//! [`UpgradableRwLock`] is the leaf primitive behind every resource in the
//! [`LockManager`](crate::LockManager). All state lives under one
//! `parking_lot::Mutex` and waiters park on a single `Condvar`.
//!
//! ## Ownership layers
//!
//! Each owner may hold up to three independent layers on the same lock:
//! a Shared count, the Upgradable slot and the Exclusive slot. Conflict
//! checks only ever look at *other* owners, so an owner that holds Shared
//! can ask for Exclusive without waiting on itself. Releasing the top layer
//! leaves the lower layers in place, which is how a promoted hold unwinds
//! back to its original mode.
//!
//! ## Fairness
//!
//! - A pending Exclusive request or a pending upgrade blocks *new* Shared
//!   owners (greedy writers). Owners already holding any layer are let
//!   through, otherwise they would deadlock against the writer they block.
//! - A pending Upgradable request does not block new Shared owners.
//! - A lock built with [`UpgradableRwLock::non_greedy`] drops the first rule:
//!   new Shared and Upgradable owners get in while a writer waits, and the
//!   writer only runs once readers happen to drain.
//! - Shared -> Exclusive for one owner goes through the Upgradable slot.
//!   When two Shared holders both try that, the second one can never be
//!   granted and receives [`LockError::UpgradeConflict`] instead of hanging.
//!
//! Releasing a layer that is not held is an invariant violation and panics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fslock_error::{LockError, Result};
use fslock_types::{LockMode, OwnerToken};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::DEFAULT_SLOW_WAIT_THRESHOLD_MS;
use crate::invariant_violation;
use crate::metrics::{
    record_acquisition, record_slow_wait, record_timeout, record_upgrade,
    record_upgrade_conflict,
};

// ---------------------------------------------------------------------------
// RwState
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RwState {
    /// Shared hold count per owner. Owners with a zero count are removed.
    shared: HashMap<OwnerToken, u32>,
    upgradable: Option<OwnerToken>,
    exclusive: Option<OwnerToken>,
    /// Owners parked in a fresh (non-upgrade) exclusive acquisition.
    exclusive_waiters: u32,
    /// The Upgradable holder is waiting for other Shared holders to drain.
    upgrade_pending: bool,
    /// Pending writers hold back new owners.
    greedy: bool,
}

impl RwState {
    fn holds_any(&self, owner: OwnerToken) -> bool {
        self.shared.contains_key(&owner)
            || self.upgradable == Some(owner)
            || self.exclusive == Some(owner)
    }

    fn has_other_shared(&self, owner: OwnerToken) -> bool {
        self.shared.len() > usize::from(self.shared.contains_key(&owner))
    }

    fn exclusive_by_other(&self, owner: OwnerToken) -> bool {
        self.exclusive.is_some_and(|holder| holder != owner)
    }

    fn upgradable_by_other(&self, owner: OwnerToken) -> bool {
        self.upgradable.is_some_and(|holder| holder != owner)
    }

    fn can_grant_shared(&self, owner: OwnerToken) -> bool {
        let writer_pending = self.greedy && (self.exclusive_waiters > 0 || self.upgrade_pending);
        !self.exclusive_by_other(owner) && (self.holds_any(owner) || !writer_pending)
    }

    fn can_grant_upgradable(&self, owner: OwnerToken) -> bool {
        !self.exclusive_by_other(owner)
            && !self.upgradable_by_other(owner)
            && (self.holds_any(owner) || !self.greedy || self.exclusive_waiters == 0)
    }

    fn can_grant_fresh_exclusive(&self) -> bool {
        self.exclusive.is_none() && self.upgradable.is_none() && self.shared.is_empty()
    }

    fn can_complete_upgrade(&self, owner: OwnerToken) -> bool {
        !self.has_other_shared(owner)
    }

    /// `owner` holds Shared while another owner's upgrade waits for exactly
    /// that Shared hold to go away.
    fn upgrade_would_deadlock(&self, owner: OwnerToken) -> bool {
        self.upgrade_pending && self.upgradable_by_other(owner) && self.shared.contains_key(&owner)
    }
}

/// Point-in-time view of an [`UpgradableRwLock`], for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RwLockState {
    /// Shared holders and their hold counts, sorted by owner.
    pub shared: Vec<(OwnerToken, u32)>,
    pub upgradable: Option<OwnerToken>,
    pub exclusive: Option<OwnerToken>,
    pub exclusive_waiters: u32,
    pub upgrade_pending: bool,
    pub greedy: bool,
}

impl RwLockState {
    /// Nobody holds any layer.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.shared.is_empty() && self.upgradable.is_none() && self.exclusive.is_none()
    }

    /// Number of distinct Shared owners.
    #[must_use]
    pub fn shared_owners(&self) -> usize {
        self.shared.len()
    }
}

// ---------------------------------------------------------------------------
// UpgradableRwLock
// ---------------------------------------------------------------------------

/// Reader/writer lock with Shared, Upgradable and Exclusive modes, keyed by
/// explicit [`OwnerToken`]s rather than thread identity.
///
/// Blocking acquisitions wait indefinitely; the `try_*` variants take a
/// timeout (zero means "probe once") and fail with [`LockError::Timeout`]
/// without leaving any trace in the lock state.
pub struct UpgradableRwLock {
    name: Arc<str>,
    slow_wait_threshold: Duration,
    state: Mutex<RwState>,
    cv: Condvar,
}

impl UpgradableRwLock {
    /// Create an unlocked greedy lock. `name` only shows up in logs and
    /// errors.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_slow_wait_threshold(name, Duration::from_millis(DEFAULT_SLOW_WAIT_THRESHOLD_MS))
    }

    /// Create an unlocked greedy lock that reports waits longer than
    /// `threshold`.
    pub fn with_slow_wait_threshold(name: impl Into<Arc<str>>, threshold: Duration) -> Self {
        Self::build(name.into(), threshold, true)
    }

    /// Create an unlocked lock whose pending writers never hold back new
    /// readers. Writers can starve under a steady stream of Shared requests.
    pub fn non_greedy(name: impl Into<Arc<str>>) -> Self {
        Self::build(
            name.into(),
            Duration::from_millis(DEFAULT_SLOW_WAIT_THRESHOLD_MS),
            false,
        )
    }

    fn build(name: Arc<str>, slow_wait_threshold: Duration, greedy: bool) -> Self {
        Self {
            name,
            slow_wait_threshold,
            state: Mutex::new(RwState {
                greedy,
                ..RwState::default()
            }),
            cv: Condvar::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether pending writers hold back new owners.
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.state.lock().greedy
    }

    // -- Shared --

    /// Block until `owner` holds the lock in Shared mode.
    pub fn acquire_shared(&self, owner: OwnerToken) -> Result<()> {
        self.acquire(owner, LockMode::Shared, None)
    }

    pub fn try_acquire_shared(&self, owner: OwnerToken, timeout: Duration) -> Result<()> {
        self.acquire(owner, LockMode::Shared, Some(timeout))
    }

    pub fn release_shared(&self, owner: OwnerToken) {
        self.release(owner, LockMode::Shared);
    }

    // -- Upgradable --

    /// Block until `owner` holds the Upgradable slot.
    ///
    /// Fails with [`LockError::UpgradeConflict`] if `owner` holds Shared and
    /// the current Upgradable holder is already waiting to upgrade.
    pub fn acquire_upgradable(&self, owner: OwnerToken) -> Result<()> {
        self.acquire(owner, LockMode::Upgradable, None)
    }

    pub fn try_acquire_upgradable(&self, owner: OwnerToken, timeout: Duration) -> Result<()> {
        self.acquire(owner, LockMode::Upgradable, Some(timeout))
    }

    pub fn release_upgradable(&self, owner: OwnerToken) {
        self.release(owner, LockMode::Upgradable);
    }

    // -- Exclusive --

    /// Block until `owner` holds the lock exclusively.
    ///
    /// If `owner` already holds Upgradable this is an upgrade; if it holds
    /// Shared the request is routed through the Upgradable slot first.
    pub fn acquire_exclusive(&self, owner: OwnerToken) -> Result<()> {
        self.acquire(owner, LockMode::Exclusive, None)
    }

    /// Bounded exclusive probe. On failure nothing about the lock changed.
    pub fn try_acquire_exclusive(&self, owner: OwnerToken, timeout: Duration) -> Result<()> {
        self.acquire(owner, LockMode::Exclusive, Some(timeout))
    }

    pub fn release_exclusive(&self, owner: OwnerToken) {
        self.release(owner, LockMode::Exclusive);
    }

    /// Promote `owner`'s Upgradable hold to Exclusive, waiting for the other
    /// Shared holders to drain. Shared requests arriving after this call
    /// started queue behind it. The Upgradable layer stays held underneath.
    pub fn upgrade_to_exclusive(&self, owner: OwnerToken) -> Result<()> {
        self.upgrade(owner, None)
    }

    /// Bounded variant of [`upgrade_to_exclusive`](Self::upgrade_to_exclusive).
    /// On timeout `owner` still holds Upgradable and nothing else changed.
    pub fn try_upgrade_to_exclusive(&self, owner: OwnerToken, timeout: Duration) -> Result<()> {
        self.upgrade(owner, Some(timeout))
    }

    fn upgrade(&self, owner: OwnerToken, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let state = self.state.lock();
        if state.upgradable != Some(owner) {
            drop(state);
            self.violation(owner, "upgraded without holding the upgradable slot");
        }
        self.upgrade_locked(state, owner, started, deadline, true, false)
    }

    // -- Generic entry points --

    /// Acquire `mode` for `owner`, waiting at most `timeout` (forever when
    /// `None`).
    pub fn acquire(&self, owner: OwnerToken, mode: LockMode, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut state = self.state.lock();

        let contended = match mode {
            LockMode::Shared => {
                let contended = self.wait_for(&mut state, owner, mode, started, deadline, |s| {
                    Ok(s.can_grant_shared(owner))
                })?;
                *state.shared.entry(owner).or_insert(0) += 1;
                contended
            }
            LockMode::Upgradable => {
                if state.upgradable == Some(owner) {
                    drop(state);
                    self.violation(owner, "re-acquired the upgradable slot it already holds");
                }
                let contended = self.wait_for_upgradable(&mut state, owner, started, deadline)?;
                state.upgradable = Some(owner);
                contended
            }
            LockMode::Exclusive => {
                return self.acquire_exclusive_locked(state, owner, started, deadline);
            }
        };
        drop(state);
        self.granted(owner, mode, started, contended);
        Ok(())
    }

    /// Release one `mode` layer held by `owner`.
    pub fn release(&self, owner: OwnerToken, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Shared => {
                let Some(count) = state.shared.get(&owner).copied() else {
                    drop(state);
                    self.violation(owner, "released shared without holding it");
                };
                if count > 1 {
                    state.shared.insert(owner, count - 1);
                    return;
                }
                state.shared.remove(&owner);
            }
            LockMode::Upgradable => {
                if state.upgradable != Some(owner) {
                    drop(state);
                    self.violation(owner, "released upgradable without holding it");
                }
                state.upgradable = None;
            }
            LockMode::Exclusive => {
                if state.exclusive != Some(owner) {
                    drop(state);
                    self.violation(owner, "released exclusive without holding it");
                }
                state.exclusive = None;
            }
        }
        drop(state);
        self.cv.notify_all();
    }

    // -- Introspection --

    /// Snapshot of the current holders and waiters.
    #[must_use]
    pub fn state(&self) -> RwLockState {
        let state = self.state.lock();
        let mut shared: Vec<(OwnerToken, u32)> =
            state.shared.iter().map(|(&owner, &count)| (owner, count)).collect();
        shared.sort_unstable();
        RwLockState {
            shared,
            upgradable: state.upgradable,
            exclusive: state.exclusive,
            exclusive_waiters: state.exclusive_waiters,
            upgrade_pending: state.upgrade_pending,
            greedy: state.greedy,
        }
    }

    /// Whether `owner` currently holds the `mode` layer.
    #[must_use]
    pub fn holds(&self, owner: OwnerToken, mode: LockMode) -> bool {
        let state = self.state.lock();
        match mode {
            LockMode::Shared => state.shared.contains_key(&owner),
            LockMode::Upgradable => state.upgradable == Some(owner),
            LockMode::Exclusive => state.exclusive == Some(owner),
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        let state = self.state.lock();
        state.shared.is_empty() && state.upgradable.is_none() && state.exclusive.is_none()
    }

    // -- Internals --

    fn acquire_exclusive_locked(
        &self,
        mut state: MutexGuard<'_, RwState>,
        owner: OwnerToken,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if state.exclusive == Some(owner) {
            drop(state);
            self.violation(owner, "re-acquired exclusive it already holds");
        }
        if state.upgradable == Some(owner) {
            return self.upgrade_locked(state, owner, started, deadline, true, false);
        }
        if state.shared.contains_key(&owner) {
            let contended = self.wait_for_upgradable(&mut state, owner, started, deadline)?;
            state.upgradable = Some(owner);
            return self.upgrade_locked(state, owner, started, deadline, false, contended);
        }

        state.exclusive_waiters += 1;
        let waited = self.wait_for(
            &mut state,
            owner,
            LockMode::Exclusive,
            started,
            deadline,
            |s| Ok(s.can_grant_fresh_exclusive()),
        );
        state.exclusive_waiters -= 1;
        match waited {
            Ok(contended) => {
                state.exclusive = Some(owner);
                drop(state);
                self.granted(owner, LockMode::Exclusive, started, contended);
                Ok(())
            }
            Err(err) => {
                // Readers parked behind this waiter may proceed now.
                drop(state);
                self.cv.notify_all();
                Err(err)
            }
        }
    }

    /// Upgradable -> Exclusive while holding the state mutex. When
    /// `keep_upgradable` is false the Upgradable layer was only borrowed for
    /// the transition and is dropped on both outcomes.
    fn upgrade_locked(
        &self,
        mut state: MutexGuard<'_, RwState>,
        owner: OwnerToken,
        started: Instant,
        deadline: Option<Instant>,
        keep_upgradable: bool,
        contended_before: bool,
    ) -> Result<()> {
        state.upgrade_pending = true;
        // Shared holders parked on the upgradable slot must re-check for a
        // conflict now that an upgrade is pending.
        self.cv.notify_all();

        let waited = self.wait_for(
            &mut state,
            owner,
            LockMode::Exclusive,
            started,
            deadline,
            |s| Ok(s.can_complete_upgrade(owner)),
        );
        state.upgrade_pending = false;
        if !keep_upgradable {
            state.upgradable = None;
        }
        match waited {
            Ok(contended) => {
                state.exclusive = Some(owner);
                drop(state);
                record_upgrade();
                self.granted(owner, LockMode::Exclusive, started, contended || contended_before);
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.cv.notify_all();
                Err(err)
            }
        }
    }

    fn wait_for_upgradable(
        &self,
        state: &mut MutexGuard<'_, RwState>,
        owner: OwnerToken,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        self.wait_for(state, owner, LockMode::Upgradable, started, deadline, |s| {
            if s.upgrade_would_deadlock(owner) {
                record_upgrade_conflict();
                debug!(lock = %self.name, %owner, "upgrade conflict detected");
                return Err(LockError::UpgradeConflict {
                    resource: self.name.to_string(),
                    owner: owner.get(),
                });
            }
            Ok(s.can_grant_upgradable(owner))
        })
    }

    /// Park on the condvar until `ready` says yes. Returns whether the
    /// caller had to wait at all.
    fn wait_for(
        &self,
        state: &mut MutexGuard<'_, RwState>,
        owner: OwnerToken,
        mode: LockMode,
        started: Instant,
        deadline: Option<Instant>,
        mut ready: impl FnMut(&RwState) -> Result<bool>,
    ) -> Result<bool> {
        let mut contended = false;
        loop {
            if ready(&**state)? {
                return Ok(contended);
            }
            if !contended {
                contended = true;
                debug!(lock = %self.name, %owner, %mode, "lock contended, waiting");
            }
            match deadline {
                None => self.cv.wait(state),
                Some(deadline) => {
                    if self.cv.wait_until(state, deadline).timed_out() {
                        if ready(&**state)? {
                            return Ok(contended);
                        }
                        record_timeout();
                        return Err(LockError::Timeout {
                            resource: self.name.to_string(),
                            mode: mode.as_str(),
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        }
    }

    fn granted(&self, owner: OwnerToken, mode: LockMode, started: Instant, contended: bool) {
        record_acquisition(contended);
        if !contended {
            return;
        }
        let waited = started.elapsed();
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        if waited >= self.slow_wait_threshold {
            record_slow_wait();
            warn!(lock = %self.name, %owner, %mode, waited_ms, "slow lock acquisition");
        } else {
            debug!(lock = %self.name, %owner, %mode, waited_ms, "lock granted after wait");
        }
    }

    #[track_caller]
    fn violation(&self, owner: OwnerToken, what: &str) -> ! {
        invariant_violation(format_args!("{owner} {what} on {}", self.name))
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for UpgradableRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradableRwLock")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
