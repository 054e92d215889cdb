//! Per-operation lock state: the [`Locker`], its scoped guards and
//! temporary release.
//!
//! A `Locker` is the only way to take locks in the hierarchy. It keeps an
//! ordered stack of [`LockEntry`] values (acquisition order) and talks to the
//! primitives owned by the [`LockManager`] under its own [`OwnerToken`].
//!
//! ## Hierarchy
//!
//! Locking a database in mode M first takes (or re-enters) the global
//! resource in mode M, then the database itself. Unlocking a database
//! releases the database entry first and the global entry second, so the
//! global hold always brackets the database hold.
//!
//! ## Recursion and promotion
//!
//! Re-acquiring a held resource in a mode the entry already covers only
//! bumps the recursion counter. Asking for a stronger mode promotes the
//! entry through the primitive's upgrade path and remembers the previous
//! mode; the matching release restores it. Only the outermost release
//! touches the primitive's base layer.
//!
//! ## Temporary release
//!
//! [`Locker::temporary_release`] releases every primitive the locker holds,
//! regardless of recursion depth, and hands back a [`TempRelease`] handle.
//! Dropping (or [`TempRelease::restore`]-ing) the handle reacquires the
//! identical stack: same order, modes, recursion counts and promotion
//! history.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use fslock_error::Result;
use fslock_types::{LockEntry, LockMode, OwnerToken, ResourceId};
use serde::Serialize;
use tracing::{debug, error};

use crate::invariant_violation;
use crate::manager::LockManager;
use crate::metrics::record_temp_release;
use crate::rw_lock::UpgradableRwLock;

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

/// A mode an entry was promoted away from, and the recursion depth at which
/// the promotion happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Promotion {
    from: LockMode,
    depth: u32,
}

struct HeldLock {
    entry: LockEntry,
    promotions: Vec<Promotion>,
    lock: Arc<UpgradableRwLock>,
}

/// Primitive layers an entry holds, weakest first.
fn layers<'a>(
    entry: &'a LockEntry,
    promotions: &'a [Promotion],
) -> impl DoubleEndedIterator<Item = LockMode> + 'a {
    promotions
        .iter()
        .map(|promotion| promotion.from)
        .chain(std::iter::once(entry.mode))
}

/// One entry of a [`LockSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SavedLock {
    entry: LockEntry,
    promotions: Vec<Promotion>,
}

/// Ordered copy of a locker's stack taken by [`Locker::temporary_release`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    saved: Vec<SavedLock>,
    last_entered: Option<ResourceId>,
}

impl LockSnapshot {
    /// Saved entries in acquisition order.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = &LockEntry> {
        self.saved.iter().map(|saved| &saved.entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Locker
// ---------------------------------------------------------------------------

/// Lock state of one logical operation.
///
/// Never shared between threads while in use; every mutating call takes
/// `&mut self`. A locker may be moved to another thread and keeps its
/// identity there, since ownership is keyed by [`OwnerToken`].
///
/// Dropping a locker that still holds locks panics, unless the thread is
/// already unwinding, in which case the locks are released and an error is
/// logged.
pub struct Locker {
    manager: Arc<LockManager>,
    owner: OwnerToken,
    stack: Vec<HeldLock>,
    last_entered: Option<ResourceId>,
}

impl Locker {
    pub(crate) fn new(manager: Arc<LockManager>, owner: OwnerToken) -> Self {
        Self {
            manager,
            owner,
            stack: Vec::new(),
            last_entered: None,
        }
    }

    #[must_use]
    pub const fn owner(&self) -> OwnerToken {
        self.owner
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    // -- Acquisition --

    /// Lock the global resource in `mode`.
    ///
    /// The returned guard releases this one acquisition when dropped. It
    /// derefs to the locker, so nested locks are taken through it.
    pub fn lock_global(&mut self, mode: LockMode) -> Result<ScopedLock<'_>> {
        self.acquire(ResourceId::Global, mode)?;
        Ok(ScopedLock::armed(self, ResourceId::Global))
    }

    /// Lock database `name` in `mode`, taking the global resource in the same
    /// mode first.
    ///
    /// Fails with [`LockError::InvalidResourceName`](fslock_error::LockError)
    /// before touching any lock if `name` exceeds the configured length
    /// limit. If the database
    /// acquisition itself fails, the global acquisition made for it is rolled
    /// back.
    pub fn lock_database(&mut self, name: &str, mode: LockMode) -> Result<ScopedLock<'_>> {
        self.manager.validate_database_name(name)?;
        let resource = ResourceId::database(name);
        let previous = self.last_entered.clone();

        self.acquire(ResourceId::Global, mode)?;
        if let Err(err) = self.acquire(resource.clone(), mode) {
            self.release(&ResourceId::Global);
            self.last_entered = previous;
            return Err(err);
        }
        Ok(ScopedLock::armed(self, resource))
    }

    /// Release one global acquisition.
    ///
    /// Panics if the global resource is not held, or if this would drop the
    /// last global hold while database locks remain.
    pub fn unlock_global(&mut self) {
        let Some(global) = self.find(&ResourceId::Global) else {
            invariant_violation(format_args!("{} unlocked global without holding it", self.owner));
        };
        if global.entry.recursion == 1 && self.stack.iter().any(|held| !held.entry.resource.is_global()) {
            invariant_violation(format_args!(
                "{} released global while still holding database locks",
                self.owner
            ));
        }
        self.release(&ResourceId::Global);
    }

    /// Release one acquisition of database `name` and the global hold that
    /// came with it.
    pub fn unlock_database(&mut self, name: &str) {
        self.unlock_database_resource(&ResourceId::database(name));
    }

    fn unlock_database_resource(&mut self, resource: &ResourceId) {
        if self.find(resource).is_none() {
            invariant_violation(format_args!(
                "{} unlocked {resource} without holding it",
                self.owner
            ));
        }
        self.release(resource);
        self.release(&ResourceId::Global);
    }

    fn acquire(&mut self, resource: ResourceId, mode: LockMode) -> Result<()> {
        let owner = self.owner;
        if let Some(index) = self.position(&resource) {
            let held = &mut self.stack[index];
            if !held.entry.mode.covers(mode) {
                debug!(%resource, %owner, from = %held.entry.mode, to = %mode, "promoting held lock");
                held.lock.acquire(owner, mode, None)?;
                held.promotions.push(Promotion {
                    from: held.entry.mode,
                    depth: held.entry.recursion,
                });
                held.entry.mode = mode;
            }
            held.entry.recursion += 1;
        } else {
            let lock = self.manager.lock_for(&resource);
            lock.acquire(owner, mode, None)?;
            self.stack.push(HeldLock {
                entry: LockEntry::new(resource.clone(), mode),
                promotions: Vec::new(),
                lock,
            });
        }
        self.last_entered = Some(resource);
        Ok(())
    }

    fn release(&mut self, resource: &ResourceId) {
        let owner = self.owner;
        let Some(index) = self.position(resource) else {
            invariant_violation(format_args!("{owner} released {resource} without holding it"));
        };
        let held = &mut self.stack[index];

        let unwinds_promotion = held
            .promotions
            .last()
            .is_some_and(|promotion| promotion.depth + 1 == held.entry.recursion);
        if unwinds_promotion {
            held.lock.release(owner, held.entry.mode);
            if let Some(promotion) = held.promotions.pop() {
                held.entry.mode = promotion.from;
            }
            held.entry.recursion -= 1;
            return;
        }

        held.entry.recursion -= 1;
        if held.entry.recursion == 0 {
            held.lock.release(owner, held.entry.mode);
            self.stack.remove(index);
        }
    }

    fn position(&self, resource: &ResourceId) -> Option<usize> {
        self.stack.iter().position(|held| &held.entry.resource == resource)
    }

    fn find(&self, resource: &ResourceId) -> Option<&HeldLock> {
        self.stack.iter().find(|held| &held.entry.resource == resource)
    }

    // -- Temporary release --

    /// Release every lock this locker holds and return a handle that
    /// restores them when dropped.
    ///
    /// The release phase never blocks. Reacquisition may block. Taking new
    /// locks through the handle is allowed as long as they are all released
    /// again before it restores; restoring onto a non-empty locker panics.
    pub fn temporary_release(&mut self) -> TempRelease<'_> {
        let owner = self.owner;
        for held in self.stack.iter().rev() {
            for mode in layers(&held.entry, &held.promotions).rev() {
                held.lock.release(owner, mode);
            }
        }
        let saved: Vec<SavedLock> = self
            .stack
            .drain(..)
            .map(|held| SavedLock {
                entry: held.entry,
                promotions: held.promotions,
            })
            .collect();
        record_temp_release();
        debug!(%owner, entries = saved.len(), "temporarily released locks");

        let snapshot = LockSnapshot {
            saved,
            last_entered: self.last_entered.take(),
        };
        TempRelease {
            locker: self,
            snapshot: Some(snapshot),
        }
    }

    fn restore(&mut self, snapshot: LockSnapshot) -> Result<()> {
        if !self.stack.is_empty() {
            invariant_violation(format_args!(
                "{} restored a snapshot while holding {} other locks",
                self.owner,
                self.stack.len()
            ));
        }
        let owner = self.owner;
        for saved in snapshot.saved {
            let lock = self.manager.lock_for(&saved.entry.resource);
            // Strongest layer first: nothing else of ours is held on this
            // primitive yet, so no upgrade wait is ever needed.
            for mode in layers(&saved.entry, &saved.promotions).rev() {
                lock.acquire(owner, mode, None)?;
            }
            self.stack.push(HeldLock {
                entry: saved.entry,
                promotions: saved.promotions,
                lock,
            });
        }
        self.last_entered = snapshot.last_entered;
        debug!(%owner, entries = self.stack.len(), "restored temporarily released locks");
        Ok(())
    }

    fn release_all(&mut self) {
        let owner = self.owner;
        while let Some(held) = self.stack.pop() {
            for mode in layers(&held.entry, &held.promotions).rev() {
                held.lock.release(owner, mode);
            }
        }
        self.last_entered = None;
    }

    // -- Queries --

    /// The global resource is held in Exclusive mode.
    #[must_use]
    pub fn is_exclusively_locked(&self) -> bool {
        self.held_mode(&ResourceId::Global) == Some(LockMode::Exclusive)
    }

    /// Any held entry is in a read mode (Shared or Upgradable).
    #[must_use]
    pub fn has_any_shared_lock(&self) -> bool {
        self.stack.iter().any(|held| held.entry.mode.is_read_mode())
    }

    /// `resource` is readable by this locker: it is held directly, or it is a
    /// database and the global resource is held.
    #[must_use]
    pub fn is_at_least_shared_locked(&self, resource: &ResourceId) -> bool {
        self.find(resource).is_some()
            || (!resource.is_global() && self.find(&ResourceId::Global).is_some())
    }

    /// The most recently entered resource has been entered more than once.
    #[must_use]
    pub fn is_reentrant(&self) -> bool {
        self.last_entered
            .as_ref()
            .and_then(|resource| self.find(resource))
            .is_some_and(|held| held.entry.is_reentrant())
    }

    #[must_use]
    pub fn held_mode(&self, resource: &ResourceId) -> Option<LockMode> {
        self.find(resource).map(|held| held.entry.mode)
    }

    /// Recursion count on `resource`, zero when not held.
    #[must_use]
    pub fn recursion(&self, resource: &ResourceId) -> u32 {
        self.find(resource).map_or(0, |held| held.entry.recursion)
    }

    /// Held entries in acquisition order.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = &LockEntry> {
        self.stack.iter().map(|held| &held.entry)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        if self.stack.is_empty() {
            return;
        }
        if std::thread::panicking() {
            error!(
                owner = %self.owner,
                entries = self.stack.len(),
                "locker dropped while unwinding with locks held; releasing"
            );
            self.release_all();
            return;
        }
        let held: Vec<String> = self.entries().map(|entry| entry.resource.to_string()).collect();
        invariant_violation(format_args!(
            "{} dropped while still holding {held:?}",
            self.owner
        ));
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("owner", &self.owner)
            .field("entries", &self.entries().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ScopedLock
// ---------------------------------------------------------------------------

/// Guard for one `lock_global` / `lock_database` acquisition.
///
/// The guard remembers the recursion depth its acquisition created. Scopes
/// must release in the reverse order they were entered: releasing a guard
/// while an acquisition made after it (and kept with [`ScopedLock::keep`])
/// is still outstanding panics, since the release would undo that later
/// acquisition instead of this one. While unwinding, the whole locker is
/// released instead.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct ScopedLock<'a> {
    locker: &'a mut Locker,
    resource: ResourceId,
    depth: u32,
    global_depth: u32,
    armed: bool,
}

impl<'a> ScopedLock<'a> {
    fn armed(locker: &'a mut Locker, resource: ResourceId) -> Self {
        let depth = locker.recursion(&resource);
        let global_depth = locker.recursion(&ResourceId::Global);
        Self {
            locker,
            resource,
            depth,
            global_depth,
            armed: true,
        }
    }
}

impl ScopedLock<'_> {
    /// The resource this guard acquired.
    #[must_use]
    pub const fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Release now instead of at scope exit.
    pub fn unlock(mut self) {
        self.armed = false;
        self.release_scope();
    }

    /// Keep the acquisition past the guard. The caller must pair it with
    /// `unlock_global` / `unlock_database` later.
    pub fn keep(mut self) {
        self.armed = false;
    }

    fn release_scope(&mut self) {
        let depth = self.locker.recursion(&self.resource);
        let global_depth = self.locker.recursion(&ResourceId::Global);
        if depth != self.depth || global_depth != self.global_depth {
            if std::thread::panicking() {
                error!(
                    owner = %self.locker.owner,
                    resource = %self.resource,
                    "scoped lock released out of order while unwinding; releasing all locks"
                );
                self.locker.release_all();
                return;
            }
            invariant_violation(format_args!(
                "{} released {} out of scope order (recursion {depth}, acquired at {})",
                self.locker.owner, self.resource, self.depth
            ));
        }
        if self.resource.is_global() {
            self.locker.unlock_global();
        } else {
            let resource = self.resource.clone();
            self.locker.unlock_database_resource(&resource);
        }
    }
}

impl Deref for ScopedLock<'_> {
    type Target = Locker;

    fn deref(&self) -> &Locker {
        self.locker
    }
}

impl DerefMut for ScopedLock<'_> {
    fn deref_mut(&mut self) -> &mut Locker {
        self.locker
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.release_scope();
        }
    }
}

impl std::fmt::Debug for ScopedLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("resource", &self.resource)
            .field("depth", &self.depth)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TempRelease
// ---------------------------------------------------------------------------

/// Handle returned by [`Locker::temporary_release`]. Restores the saved
/// stack on drop.
#[must_use = "dropping the handle restores the locks immediately"]
pub struct TempRelease<'a> {
    locker: &'a mut Locker,
    snapshot: Option<LockSnapshot>,
}

impl TempRelease<'_> {
    /// The stack that will be restored.
    #[must_use]
    pub fn snapshot(&self) -> Option<&LockSnapshot> {
        self.snapshot.as_ref()
    }

    /// Reacquire the saved stack now.
    pub fn restore(mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(snapshot) => self.locker.restore(snapshot),
            None => Ok(()),
        }
    }
}

impl Deref for TempRelease<'_> {
    type Target = Locker;

    fn deref(&self) -> &Locker {
        self.locker
    }
}

impl DerefMut for TempRelease<'_> {
    fn deref_mut(&mut self) -> &mut Locker {
        self.locker
    }
}

impl Drop for TempRelease<'_> {
    fn drop(&mut self) {
        let Some(snapshot) = self.snapshot.take() else {
            return;
        };
        if let Err(err) = self.locker.restore(snapshot) {
            if std::thread::panicking() {
                error!(owner = %self.locker.owner, %err, "failed to restore locks while unwinding");
            } else {
                invariant_violation(format_args!(
                    "{} could not restore temporarily released locks: {err}",
                    self.locker.owner
                ));
            }
        }
    }
}

impl std::fmt::Debug for TempRelease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempRelease")
            .field("owner", &self.locker.owner)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fslock_error::LockError;
    use proptest::prelude::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::thread;
    use std::time::{Duration, Instant};

    fn db(name: &str) -> ResourceId {
        ResourceId::database(name)
    }

    fn snapshot_entries(locker: &Locker) -> Vec<LockEntry> {
        locker.entries().cloned().collect()
    }

    #[test]
    fn test_recursion_correctness() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let foo = db("foo");

        locker.lock_database("foo", LockMode::Shared).unwrap().keep();
        locker.lock_database("foo", LockMode::Shared).unwrap().keep();
        assert_eq!(locker.recursion(&foo), 2);
        assert_eq!(locker.recursion(&ResourceId::Global), 2);

        locker.unlock_database("foo");
        assert!(locker.is_at_least_shared_locked(&foo));
        locker.unlock_database("foo");
        assert!(!locker.is_at_least_shared_locked(&foo));
        assert!(locker.is_empty());
        assert!(manager.lock_for(&foo).is_free());
        assert!(manager.lock_for(&ResourceId::Global).is_free());
    }

    #[test]
    fn test_nested_database_scopes() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        {
            let mut global = locker.lock_global(LockMode::Shared).unwrap();
            let mut foo = global.lock_database("foo", LockMode::Shared).unwrap();
            {
                let mut foo_again = foo.lock_database("foo", LockMode::Shared).unwrap();
                assert!(foo_again.is_reentrant());
                let local = foo_again.lock_database("local", LockMode::Shared).unwrap();
                assert!(local.is_at_least_shared_locked(&db("foo")));
                assert!(local.is_at_least_shared_locked(&db("local")));
                assert!(!local.is_reentrant());
                assert!(local.has_any_shared_lock());
                assert!(!local.is_exclusively_locked());
                assert_eq!(local.recursion(&ResourceId::Global), 4);
            }
            assert_eq!(foo.recursion(&ResourceId::Global), 2);
            assert!(foo.held_mode(&db("local")).is_none());
        }
        assert!(locker.is_empty());
    }

    #[test]
    fn test_global_shared_covers_databases() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let guard = locker.lock_global(LockMode::Shared).unwrap();
        assert!(guard.is_at_least_shared_locked(&db("anything")));
        assert!(guard.held_mode(&db("anything")).is_none());
    }

    #[test]
    fn test_promotion_unwinds_to_previous_mode() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let global = manager.lock_for(&ResourceId::Global);

        let mut shared = locker.lock_global(LockMode::Shared).unwrap();
        {
            let exclusive = shared.lock_global(LockMode::Exclusive).unwrap();
            assert!(exclusive.is_exclusively_locked());
            assert!(global.holds(exclusive.owner(), LockMode::Exclusive));
            // Covered by Exclusive: recursion only.
            let mut exclusive = exclusive;
            exclusive.lock_global(LockMode::Shared).unwrap().unlock();
            assert!(exclusive.is_exclusively_locked());
        }
        assert_eq!(shared.held_mode(&ResourceId::Global), Some(LockMode::Shared));
        assert!(!global.holds(shared.owner(), LockMode::Exclusive));
        assert!(global.holds(shared.owner(), LockMode::Shared));
        drop(shared);
        assert!(global.is_free());
    }

    #[test]
    fn test_exclusive_database_takes_global_exclusive() {
        let manager = LockManager::with_defaults();
        let mut writer = manager.locker();
        let mut reader = manager.locker();

        let guard = writer.lock_database("foo", LockMode::Exclusive).unwrap();
        assert!(guard.is_exclusively_locked());
        // Other databases are untouched at their own level, but nobody else
        // can get past the global resource.
        manager
            .try_lock_exclusive_probe(&db("bar"), Duration::ZERO)
            .unwrap();
        let err = manager
            .try_lock_exclusive_probe(&ResourceId::Global, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        drop(guard);

        reader.lock_database("foo", LockMode::Shared).unwrap().unlock();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_free_form_database_names() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let long = "x".repeat(65);
        for name in ["", "a\tb", long.as_str()] {
            let guard = locker.lock_database(name, LockMode::Exclusive).unwrap();
            assert_eq!(guard.held_mode(&db(name)), Some(LockMode::Exclusive));
        }
        assert!(locker.is_empty());
    }

    #[test]
    fn test_overlong_database_name_touches_nothing() {
        let manager = LockManager::new(crate::LockManagerConfig {
            max_database_name_len: Some(8),
            ..crate::LockManagerConfig::default()
        })
        .unwrap();
        let mut locker = manager.locker();
        let err = locker.lock_database("much_too_long", LockMode::Shared).unwrap_err();
        assert!(matches!(err, LockError::InvalidResourceName { .. }));
        assert!(locker.is_empty());
        assert_eq!(manager.database_count(), 0);
    }

    #[test]
    fn test_upgrade_conflict_rolls_back() {
        let manager = LockManager::with_defaults();
        let mut first = manager.locker();
        let mut second = manager.locker();
        first.lock_global(LockMode::Shared).unwrap().keep();
        second.lock_global(LockMode::Shared).unwrap().keep();

        let global = manager.lock_for(&ResourceId::Global);
        let handle = thread::spawn(move || {
            first.lock_database("x", LockMode::Exclusive).unwrap().keep();
            assert!(first.is_exclusively_locked());
            first.unlock_database("x");
            first.unlock_global();
            first
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while !global.state().upgrade_pending {
            assert!(Instant::now() < deadline, "first locker never started upgrading");
            thread::sleep(Duration::from_millis(1));
        }

        let err = second.lock_database("y", LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, LockError::UpgradeConflict { .. }));
        assert_eq!(second.held_mode(&ResourceId::Global), Some(LockMode::Shared));
        assert_eq!(second.recursion(&ResourceId::Global), 1);

        second.unlock_global();
        let first = handle.join().unwrap();
        assert!(first.is_empty());
        assert!(global.is_free());
    }

    #[test]
    fn test_scope_releases_on_unwind() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut global = locker.lock_global(LockMode::Shared).unwrap();
            let _db = global.lock_database("foo", LockMode::Exclusive).unwrap();
            panic!("caller failure inside locked scope");
        }));
        assert!(result.is_err());
        assert!(locker.is_empty());
        assert!(manager.lock_for(&ResourceId::Global).is_free());
        assert!(manager.lock_for(&db("foo")).is_free());
    }

    #[test]
    fn test_temporary_release_frees_and_restores() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let mut global = locker.lock_global(LockMode::Shared).unwrap();
        let mut foo = global.lock_database("foo", LockMode::Exclusive).unwrap();
        let before = snapshot_entries(&foo);
        {
            let released = foo.temporary_release();
            assert!(released.is_empty());
            assert_eq!(released.snapshot().map(LockSnapshot::len), Some(2));
            // Another operation can now write.
            let mut other = manager.locker();
            other.lock_database("foo", LockMode::Exclusive).unwrap().unlock();
        }
        assert_eq!(snapshot_entries(&foo), before);
        assert!(foo.is_exclusively_locked());
    }

    #[test]
    fn test_temporary_release_allows_balanced_work() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let mut global = locker.lock_global(LockMode::Upgradable).unwrap();
        let mut released = global.temporary_release();
        released.lock_database("tmp", LockMode::Shared).unwrap().unlock();
        released.restore().unwrap();
        assert_eq!(global.held_mode(&ResourceId::Global), Some(LockMode::Upgradable));
    }

    #[test]
    #[should_panic(expected = "out of scope order")]
    fn test_outer_scope_cannot_release_kept_inner_acquisition() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let mut shared = locker.lock_global(LockMode::Shared).unwrap();
        shared.lock_global(LockMode::Exclusive).unwrap().keep();
        assert!(shared.is_exclusively_locked());
        drop(shared);
    }

    #[test]
    fn test_kept_inner_acquisition_survives_other_lockers() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let mut shared = locker.lock_global(LockMode::Shared).unwrap();
        shared.lock_global(LockMode::Exclusive).unwrap().keep();
        // Pairing the kept acquisition first leaves the outer scope intact.
        shared.unlock_global();
        assert_eq!(shared.held_mode(&ResourceId::Global), Some(LockMode::Shared));
        let mut other = manager.locker();
        other.lock_global(LockMode::Shared).unwrap().unlock();
        drop(shared);
        assert!(locker.is_empty());
    }

    #[test]
    fn test_out_of_order_scope_releases_everything_on_unwind() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut shared = locker.lock_global(LockMode::Shared).unwrap();
            shared.lock_database("foo", LockMode::Exclusive).unwrap().keep();
            panic!("caller failure with a kept acquisition");
        }));
        assert!(result.is_err());
        assert!(locker.is_empty());
        assert!(manager.lock_for(&ResourceId::Global).is_free());
        assert!(manager.lock_for(&db("foo")).is_free());
    }

    #[test]
    #[should_panic(expected = "restored a snapshot while holding")]
    fn test_restore_onto_diverged_locker_panics() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        locker.lock_global(LockMode::Shared).unwrap().keep();
        let mut released = locker.temporary_release();
        released.lock_database("leak", LockMode::Shared).unwrap().keep();
        let _ = released.restore();
    }

    #[test]
    #[should_panic(expected = "unlocked global without holding it")]
    fn test_unlock_not_held_panics() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        locker.unlock_global();
    }

    #[test]
    #[should_panic(expected = "released global while still holding database locks")]
    fn test_unlock_global_below_database_panics() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        locker.lock_database("foo", LockMode::Shared).unwrap().keep();
        locker.unlock_global();
    }

    #[test]
    #[should_panic(expected = "dropped while still holding")]
    fn test_drop_holding_locks_panics() {
        let manager = LockManager::with_defaults();
        let mut locker = manager.locker();
        locker.lock_global(LockMode::Shared).unwrap().keep();
        drop(locker);
    }

    // ----- Temporary-release round trip -----

    fn op_strategy() -> impl Strategy<Value = (usize, LockMode)> {
        (0usize..3, prop::sample::select(LockMode::ALL.to_vec()))
    }

    const TARGETS: [&str; 3] = ["", "foo", "local"];

    proptest! {
        #[test]
        fn prop_temporary_release_round_trip(ops in prop::collection::vec(op_strategy(), 0..12)) {
            let manager = LockManager::with_defaults();
            let mut locker = manager.locker();
            let owner = locker.owner();
            for &(target, mode) in &ops {
                if target == 0 {
                    locker.lock_global(mode).unwrap().keep();
                } else {
                    locker.lock_database(TARGETS[target], mode).unwrap().keep();
                }
            }
            let resources = [ResourceId::Global, db("foo"), db("local")];
            let entries_before = snapshot_entries(&locker);
            let states_before: Vec<_> = resources
                .iter()
                .map(|resource| manager.lock_for(resource).state())
                .collect();
            let reentrant_before = locker.is_reentrant();

            {
                let released = locker.temporary_release();
                for resource in &resources {
                    prop_assert!(manager.lock_for(resource).is_free());
                }
                prop_assert!(released.is_empty());
            }

            prop_assert_eq!(snapshot_entries(&locker), entries_before);
            prop_assert_eq!(locker.is_reentrant(), reentrant_before);
            for (resource, before) in resources.iter().zip(&states_before) {
                prop_assert_eq!(&manager.lock_for(resource).state(), before);
            }

            for &(target, _) in ops.iter().rev() {
                if target == 0 {
                    locker.unlock_global();
                } else {
                    locker.unlock_database(TARGETS[target]);
                }
            }
            prop_assert!(locker.is_empty());
            for resource in &resources {
                let lock = manager.lock_for(resource);
                prop_assert!(lock.is_free(), "{resource} still held by {owner}");
            }
        }
    }
}
