//! Verification harness for the fslock lock manager.
//!
//! Reusable tooling for threaded lock tests: a worker runner that reports
//! stuck threads instead of hanging the test binary, an occupancy gauge for
//! admission bounds, and the mixed locker workload that drives the stress
//! tests under `tests/`.

pub mod gauge;
pub mod runner;
pub mod workload;

use std::time::{Duration, Instant};

use fslock_core::LockError;
use thiserror::Error;

pub use gauge::{GaugeGuard, HighWaterGauge};
pub use runner::{StuckThreads, run_threads};
pub use workload::{MixedWorkload, WorkloadStats, run_mixed_locker_workload};

/// Failures surfaced by harness helpers.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("worker {worker} check failed at iteration {iteration}: {what}")]
    CheckFailed {
        worker: usize,
        iteration: usize,
        what: &'static str,
    },

    #[error("{0}")]
    Stuck(StuckThreads),

    #[error("worker {index} panicked: {message}")]
    WorkerPanicked { index: usize, message: String },

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Yield for a few microseconds so other workers get a chance to contend.
pub fn spin_briefly() {
    spin_for(Duration::from_micros(8));
}

/// Yield in a loop until `hold` has elapsed, without sleeping.
pub fn spin_for(hold: Duration) {
    let started = Instant::now();
    while started.elapsed() < hold {
        std::thread::yield_now();
    }
}
