//! Ticket-based admission control.
//!
//! A [`TicketHolder`] is a counting semaphore with a fixed capacity. Waiters
//! are admitted strictly in arrival order (wait-ticket FIFO), and the
//! non-blocking probe never overtakes a queued waiter, so a steady stream
//! of probes cannot starve a blocked caller.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use fslock_error::{LockError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::TicketHolderConfig;
use crate::invariant_violation;
use crate::metrics::{record_ticket_acquired, record_ticket_exhausted};

static GLOBAL_TICKETS: OnceLock<TicketHolder> = OnceLock::new();

#[derive(Debug)]
struct TicketQueueState {
    outstanding: usize,
    high_water: usize,
    next_wait_ticket: u64,
    wait_queue: VecDeque<u64>,
}

impl TicketQueueState {
    fn can_admit(&self, wait_ticket: u64, capacity: usize) -> bool {
        self.wait_queue.front().copied() == Some(wait_ticket) && self.outstanding < capacity
    }

    fn remove_wait_ticket(&mut self, wait_ticket: u64) {
        if let Some(pos) = self.wait_queue.iter().position(|queued| *queued == wait_ticket) {
            let _ = self.wait_queue.remove(pos);
        }
    }

    fn take(&mut self) {
        self.outstanding += 1;
        self.high_water = self.high_water.max(self.outstanding);
    }
}

/// Fixed-capacity pool of admission tickets.
pub struct TicketHolder {
    capacity: usize,
    state: Mutex<TicketQueueState>,
    cv: Condvar,
}

impl TicketHolder {
    /// Create a pool from a validated configuration.
    pub fn new(config: TicketHolderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.capacity,
            state: Mutex::new(TicketQueueState {
                outstanding: 0,
                high_water: 0,
                next_wait_ticket: 1,
                wait_queue: VecDeque::new(),
            }),
            cv: Condvar::new(),
        })
    }

    /// Shorthand for `new(TicketHolderConfig::with_capacity(capacity))`.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(TicketHolderConfig::with_capacity(capacity))
    }

    /// Install the process-wide pool. Fails if one is already installed.
    pub fn install_global(config: TicketHolderConfig) -> Result<&'static Self> {
        let holder = Self::new(config)?;
        let mut installed = false;
        let global = GLOBAL_TICKETS.get_or_init(|| {
            installed = true;
            holder
        });
        if !installed {
            return Err(LockError::AlreadyInitialized {
                what: "global ticket holder",
            });
        }
        info!(capacity = config.capacity, "global ticket holder installed");
        Ok(global)
    }

    /// The process-wide pool, if installed.
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL_TICKETS.get()
    }

    // -- Acquisition --

    /// Block until a ticket is available.
    pub fn wait_for_ticket(&self) -> Ticket<'_> {
        let mut state = self.state.lock();
        if self.admit_immediately(&mut state) {
            drop(state);
            record_ticket_acquired(false);
            return Ticket::new(self);
        }
        let wait_ticket = Self::enqueue(&mut state);
        while !state.can_admit(wait_ticket, self.capacity) {
            self.cv.wait(&mut state);
        }
        self.admit_waiter(state);
        Ticket::new(self)
    }

    /// Take a ticket only if one is free right now and nobody is queued.
    pub fn try_acquire_ticket(&self) -> Result<Ticket<'_>> {
        let mut state = self.state.lock();
        if self.admit_immediately(&mut state) {
            drop(state);
            record_ticket_acquired(false);
            return Ok(Ticket::new(self));
        }
        drop(state);
        record_ticket_exhausted();
        Err(LockError::TicketsExhausted {
            capacity: self.capacity,
        })
    }

    /// Wait at most `timeout` for a ticket.
    pub fn wait_for_ticket_timeout(&self, timeout: Duration) -> Result<Ticket<'_>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.state.lock();
        if self.admit_immediately(&mut state) {
            drop(state);
            record_ticket_acquired(false);
            return Ok(Ticket::new(self));
        }
        let wait_ticket = Self::enqueue(&mut state);
        while !state.can_admit(wait_ticket, self.capacity) {
            if self.cv.wait_until(&mut state, deadline).timed_out()
                && !state.can_admit(wait_ticket, self.capacity)
            {
                state.remove_wait_ticket(wait_ticket);
                drop(state);
                // The next waiter may now be at the front.
                self.cv.notify_all();
                record_ticket_exhausted();
                return Err(LockError::TicketTimeout {
                    capacity: self.capacity,
                    waited: started.elapsed(),
                });
            }
        }
        self.admit_waiter(state);
        Ok(Ticket::new(self))
    }

    /// Return one ticket to the pool.
    ///
    /// Prefer dropping the [`Ticket`] guard. Releasing with nothing
    /// outstanding panics.
    pub fn release_ticket(&self) {
        let mut state = self.state.lock();
        if state.outstanding == 0 {
            drop(state);
            invariant_violation(format_args!(
                "ticket released with none outstanding (capacity {})",
                self.capacity
            ));
        }
        state.outstanding -= 1;
        let wake = !state.wait_queue.is_empty();
        drop(state);
        if wake {
            self.cv.notify_all();
        }
    }

    fn admit_immediately(&self, state: &mut MutexGuard<'_, TicketQueueState>) -> bool {
        if state.wait_queue.is_empty() && state.outstanding < self.capacity {
            state.take();
            return true;
        }
        false
    }

    fn enqueue(state: &mut MutexGuard<'_, TicketQueueState>) -> u64 {
        let wait_ticket = state.next_wait_ticket;
        state.next_wait_ticket = state.next_wait_ticket.wrapping_add(1);
        state.wait_queue.push_back(wait_ticket);
        debug!(wait_ticket, queued = state.wait_queue.len(), "waiting for admission ticket");
        wait_ticket
    }

    fn admit_waiter(&self, mut state: MutexGuard<'_, TicketQueueState>) {
        let _ = state.wait_queue.pop_front();
        state.take();
        let more_room = !state.wait_queue.is_empty() && state.outstanding < self.capacity;
        drop(state);
        record_ticket_acquired(true);
        if more_room {
            self.cv.notify_all();
        }
    }

    // -- Introspection --

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.state.lock().outstanding
    }

    /// Callers currently queued in `wait_for_ticket*`.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().wait_queue.len()
    }

    /// Highest `outstanding` value ever observed.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.state.lock().high_water
    }
}

impl std::fmt::Debug for TicketHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TicketHolder")
            .field("capacity", &self.capacity)
            .field("outstanding", &state.outstanding)
            .field("waiters", &state.wait_queue.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Ticket guard
// ---------------------------------------------------------------------------

/// One admission ticket. Returned to the pool on drop.
#[must_use = "dropping the ticket releases it immediately"]
pub struct Ticket<'a> {
    holder: &'a TicketHolder,
}

impl<'a> Ticket<'a> {
    const fn new(holder: &'a TicketHolder) -> Self {
        Self { holder }
    }

    /// Return the ticket now.
    pub fn release(self) {
        drop(self);
    }

    /// Forget the guard; the caller must call
    /// [`TicketHolder::release_ticket`] later.
    pub fn detach(self) -> &'a TicketHolder {
        let holder = self.holder;
        std::mem::forget(self);
        holder
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.holder.release_ticket();
    }
}

impl std::fmt::Debug for Ticket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("capacity", &self.holder.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            TicketHolder::with_capacity(0),
            Err(LockError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_global_installs_once() {
        let global = TicketHolder::install_global(TicketHolderConfig::with_capacity(3)).unwrap();
        assert_eq!(global.capacity(), 3);
        assert!(matches!(
            TicketHolder::install_global(TicketHolderConfig::default()),
            Err(LockError::AlreadyInitialized { .. })
        ));
        assert_eq!(TicketHolder::global().map(TicketHolder::capacity), Some(3));
        global.wait_for_ticket().release();
    }

    #[test]
    fn test_try_acquire_respects_capacity() {
        let holder = TicketHolder::with_capacity(2).unwrap();
        let a = holder.try_acquire_ticket().unwrap();
        let b = holder.try_acquire_ticket().unwrap();
        assert_eq!(holder.available(), 0);
        assert!(matches!(
            holder.try_acquire_ticket(),
            Err(LockError::TicketsExhausted { capacity: 2 })
        ));
        a.release();
        assert_eq!(holder.outstanding(), 1);
        drop(b);
        assert_eq!(holder.available(), 2);
        assert_eq!(holder.high_water_mark(), 2);
    }

    #[test]
    fn test_detach_and_manual_release() {
        let holder = TicketHolder::with_capacity(1).unwrap();
        let owner = holder.wait_for_ticket().detach();
        assert_eq!(owner.outstanding(), 1);
        owner.release_ticket();
        assert_eq!(holder.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "ticket released with none outstanding")]
    fn test_double_release_panics() {
        let holder = TicketHolder::with_capacity(1).unwrap();
        holder.wait_for_ticket().release();
        holder.release_ticket();
    }

    #[test]
    fn test_timeout_leaves_no_waiter_behind() {
        let holder = TicketHolder::with_capacity(1).unwrap();
        let _held = holder.wait_for_ticket();
        let err = holder
            .wait_for_ticket_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, LockError::TicketTimeout { capacity: 1, .. }));
        assert_eq!(holder.waiters(), 0);
        assert_eq!(holder.outstanding(), 1);
    }

    #[test]
    fn test_probe_does_not_barge_past_waiter() {
        let holder = Arc::new(TicketHolder::with_capacity(1).unwrap());
        let held = holder.wait_for_ticket().detach();
        let admitted = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let holder = Arc::clone(&holder);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let ticket = holder.wait_for_ticket();
                admitted.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                drop(ticket);
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while holder.waiters() == 0 {
            assert!(Instant::now() < deadline, "waiter never queued");
            thread::sleep(Duration::from_millis(1));
        }

        held.release_ticket();
        // Between release and the waiter waking, the slot belongs to the
        // queued caller.
        if let Ok(ticket) = holder.try_acquire_ticket() {
            assert_eq!(admitted.load(Ordering::SeqCst), 1);
            drop(ticket);
        }
        waiter.join().unwrap();
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(holder.outstanding(), 0);
    }

    #[test]
    fn test_waiters_admitted_in_arrival_order() {
        let holder = Arc::new(TicketHolder::with_capacity(1).unwrap());
        let held = holder.wait_for_ticket().detach();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..4 {
            let waiter_holder = Arc::clone(&holder);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _ticket = waiter_holder.wait_for_ticket();
                order.lock().push(id);
            }));
            let deadline = Instant::now() + Duration::from_secs(5);
            while holder.waiters() != id + 1 {
                assert!(Instant::now() < deadline, "waiter {id} never queued");
                thread::sleep(Duration::from_millis(1));
            }
        }

        held.release_ticket();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
