//! Bounded-time threaded runner.
//!
//! Lock bugs usually show up as hangs. [`run_threads`] starts every worker
//! behind a barrier and waits for them with a deadline; if the deadline
//! passes, it returns a [`StuckThreads`] report naming the workers that never
//! finished. Stuck workers are left detached.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::HarnessError;

/// Workers that had not finished when the deadline passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckThreads {
    pub timeout_ms: u64,
    pub workers: usize,
    /// Worker indices, ascending.
    pub stuck: Vec<usize>,
}

impl StuckThreads {
    /// Machine-readable report.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self}"))
    }
}

impl fmt::Display for StuckThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} workers still running after {}ms: {:?}",
            self.stuck.len(),
            self.workers,
            self.timeout_ms,
            self.stuck
        )
    }
}

/// Run `work(index)` on `workers` threads started together, and collect the
/// results in index order.
///
/// Returns [`HarnessError::Stuck`] if any worker is still running after
/// `timeout`, and [`HarnessError::WorkerPanicked`] for the first panicking
/// worker.
pub fn run_threads<T, F>(workers: usize, timeout: Duration, work: F) -> Result<Vec<T>, HarnessError>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let barrier = Arc::new(Barrier::new(workers));
    let (tx, rx) = mpsc::channel::<(usize, thread::Result<T>)>();

    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let work = Arc::clone(&work);
        let barrier = Arc::clone(&barrier);
        let tx = tx.clone();
        let handle = thread::Builder::new()
            .name(format!("fslock-worker-{index}"))
            .spawn(move || {
                barrier.wait();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(index)));
                let _ = tx.send((index, outcome));
            })
            .map_err(|source| HarnessError::Spawn { index, source })?;
        handles.push(handle);
    }
    drop(tx);
    debug!(workers, timeout_ms = duration_ms(timeout), "workers started");

    let deadline = Instant::now() + timeout;
    let mut results: Vec<Option<T>> = (0..workers).map(|_| None).collect();
    let mut finished = 0;
    while finished < workers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((index, Ok(value))) => {
                results[index] = Some(value);
                finished += 1;
            }
            Ok((index, Err(payload))) => {
                return Err(HarnessError::WorkerPanicked {
                    index,
                    message: panic_message(payload.as_ref()),
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                let report = StuckThreads {
                    timeout_ms: duration_ms(timeout),
                    workers,
                    stuck: results
                        .iter()
                        .enumerate()
                        .filter(|(_, result)| result.is_none())
                        .map(|(index, _)| index)
                        .collect(),
                };
                warn!(report = %report.to_json(), "workers stuck");
                return Err(HarnessError::Stuck(report));
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for handle in handles {
        let _ = handle.join();
    }
    Ok(results.into_iter().flatten().collect())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
