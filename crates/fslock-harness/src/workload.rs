//! Mixed locker workload used by the stress tests.
//!
//! Each iteration picks one of a fixed set of lock patterns (nested global
//! reads, global writes with temporary release, database reads and writes
//! under and without an explicit global lock) and checks the locker's query
//! predicates along the way. Only worker 1 runs the extra global-write
//! pattern, so the worker count changes the write pressure.

use fslock_core::{LockMode, Locker, ResourceId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::HarnessError;

/// Shape of one worker's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MixedWorkload {
    pub iterations: usize,
    /// Base seed; each worker mixes in its own index.
    pub seed: u64,
}

impl Default for MixedWorkload {
    fn default() -> Self {
        Self {
            iterations: 2_000,
            seed: 0x5EED_F00D,
        }
    }
}

/// What one worker did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadStats {
    pub global_shared: u64,
    pub global_exclusive: u64,
    pub database_shared: u64,
    pub database_exclusive: u64,
    pub temp_releases: u64,
}

impl WorkloadStats {
    pub fn merge(&mut self, other: &Self) {
        self.global_shared += other.global_shared;
        self.global_exclusive += other.global_exclusive;
        self.database_shared += other.database_shared;
        self.database_exclusive += other.database_exclusive;
        self.temp_releases += other.temp_releases;
    }
}

struct Step<'a> {
    worker: usize,
    iteration: usize,
    stats: &'a mut WorkloadStats,
}

impl Step<'_> {
    fn check(&self, ok: bool, what: &'static str) -> Result<(), HarnessError> {
        if ok {
            Ok(())
        } else {
            Err(HarnessError::CheckFailed {
                worker: self.worker,
                iteration: self.iteration,
                what,
            })
        }
    }

    fn count(&mut self, resource_is_global: bool, mode: LockMode) {
        let slot = match (resource_is_global, mode) {
            (true, LockMode::Exclusive) => &mut self.stats.global_exclusive,
            (true, _) => &mut self.stats.global_shared,
            (false, LockMode::Exclusive) => &mut self.stats.database_exclusive,
            (false, _) => &mut self.stats.database_shared,
        };
        *slot += 1;
    }
}

/// Drive `locker` through `config.iterations` lock patterns.
///
/// The locker is empty again when this returns `Ok`.
pub fn run_mixed_locker_workload(
    locker: &mut Locker,
    worker: usize,
    config: MixedWorkload,
) -> Result<WorkloadStats, HarnessError> {
    let mut rng = StdRng::seed_from_u64(config.seed ^ worker as u64);
    let mut stats = WorkloadStats::default();
    let foo = ResourceId::database("foo");
    let local = ResourceId::database("local");

    for iteration in 0..config.iterations {
        let sometimes = rng.gen_range(0..15) == 0;
        let mut step = Step {
            worker,
            iteration,
            stats: &mut stats,
        };
        match iteration % 7 {
            0 => {
                let mut outer = locker.lock_global(LockMode::Shared)?;
                let _inner = outer.lock_global(LockMode::Shared)?;
                step.count(true, LockMode::Shared);
                step.count(true, LockMode::Shared);
            }
            1 => {
                let guard = locker.lock_global(LockMode::Shared)?;
                step.count(true, LockMode::Shared);
                step.check(guard.has_any_shared_lock(), "global read reports a shared lock")?;
            }
            4 if worker == 1 => {
                let guard = locker.lock_global(LockMode::Exclusive)?;
                step.count(true, LockMode::Exclusive);
                step.check(guard.is_exclusively_locked(), "global write is exclusive")?;
            }
            2 => {
                let mut guard = locker.lock_global(LockMode::Exclusive)?;
                step.count(true, LockMode::Exclusive);
                step.check(guard.is_exclusively_locked(), "global write is exclusive")?;
                if sometimes {
                    guard.temporary_release().restore()?;
                    step.stats.temp_releases += 1;
                }
            }
            3 => {
                let mut write = locker.lock_global(LockMode::Exclusive)?;
                step.count(true, LockMode::Exclusive);
                write.temporary_release().restore()?;
                step.stats.temp_releases += 1;

                let mut read = write.lock_global(LockMode::Shared)?;
                step.count(true, LockMode::Shared);
                step.check(read.is_exclusively_locked(), "read under write stays exclusive")?;
                if sometimes {
                    read.temporary_release().restore()?;
                    step.stats.temp_releases += 1;
                }
            }
            5 => {
                locker.lock_database("foo", LockMode::Shared)?.unlock();
                locker.lock_database("bar", LockMode::Shared)?.unlock();
                step.count(false, LockMode::Shared);
                step.count(false, LockMode::Shared);
            }
            6 if iteration > config.iterations / 2 => {
                late_database_patterns(locker, &mut step, sometimes, &foo, &local)?;
            }
            6 => {
                let mut first = locker.lock_database("foo", LockMode::Shared)?;
                let mut second = first.lock_database("foo", LockMode::Shared)?;
                let _third = second.lock_database("local", LockMode::Shared)?;
                for _ in 0..3 {
                    step.count(false, LockMode::Shared);
                }
            }
            _ => {}
        }
        if !locker.is_empty() {
            return Err(HarnessError::CheckFailed {
                worker,
                iteration,
                what: "locker empty between iterations",
            });
        }
    }
    debug!(worker, ?stats, "mixed workload finished");
    Ok(stats)
}

fn late_database_patterns(
    locker: &mut Locker,
    step: &mut Step<'_>,
    sometimes: bool,
    foo: &ResourceId,
    local: &ResourceId,
) -> Result<(), HarnessError> {
    match step.iteration % 11 {
        0 => {
            let mut first = locker.lock_database("foo", LockMode::Shared)?;
            step.check(first.is_at_least_shared_locked(foo), "foo readable")?;
            step.check(!first.is_reentrant(), "single foo entry is not reentrant")?;
            let mut second = first.lock_database("foo", LockMode::Shared)?;
            step.check(second.is_reentrant(), "second foo entry is reentrant")?;
            let third = second.lock_database("local", LockMode::Shared)?;
            step.check(third.is_at_least_shared_locked(foo), "foo still readable")?;
            step.check(third.is_at_least_shared_locked(local), "local readable")?;
            for _ in 0..3 {
                step.count(false, LockMode::Shared);
            }
        }
        1 => {
            locker.lock_database("local", LockMode::Shared)?.unlock();
            step.count(false, LockMode::Shared);
            let mut write = locker.lock_database("local", LockMode::Exclusive)?;
            step.count(false, LockMode::Exclusive);
            if sometimes {
                write.temporary_release().restore()?;
                step.stats.temp_releases += 1;
            }
        }
        2 => {
            locker.lock_database("admin", LockMode::Shared)?.unlock();
            locker.lock_database("admin", LockMode::Exclusive)?.unlock();
            step.count(false, LockMode::Shared);
            step.count(false, LockMode::Exclusive);
        }
        3 => {
            let mut write = locker.lock_database("foo", LockMode::Exclusive)?;
            let _read = write.lock_database("admin", LockMode::Shared)?;
            step.count(false, LockMode::Exclusive);
            step.count(false, LockMode::Shared);
        }
        4 => {
            let mut first = locker.lock_database("foo2", LockMode::Shared)?;
            let _second = first.lock_database("admin", LockMode::Shared)?;
            step.count(false, LockMode::Shared);
            step.count(false, LockMode::Shared);
        }
        _ => {
            let mut write = locker.lock_database("foo", LockMode::Exclusive)?;
            step.count(false, LockMode::Exclusive);
            write.temporary_release().restore()?;
            step.stats.temp_releases += 1;
            let mut read = write.lock_database("foo", LockMode::Shared)?;
            let _local = read.lock_database("local", LockMode::Shared)?;
            step.count(false, LockMode::Shared);
            step.count(false, LockMode::Shared);
        }
    }
    Ok(())
}
