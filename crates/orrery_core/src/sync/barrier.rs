//! # Rendezvous Barrier
//!
//! Reusable two-phase synchronization point between one master thread and a
//! fixed number of slaves.
//!
//! ## Round Protocol
//!
//! ```text
//! MASTER                              SLAVE x N
//!   |                                   |
//!   |-- master_open_barrier() --------->| slave_wait_for_first_open() returns
//!   |                                   | ... work ...
//!   |   master_wait_for_close()         | slave_wait_for_reset()  (arrival++)
//!   |   (services master invocations)   |   blocks until the NEXT open
//!   |<-- arrivals == N -----------------|
//!   |   counter reset, round closed     |
//!   |-- master_open_barrier() --------->| slave_wait_for_reset() returns
//! ```
//!
//! ## Poisoning
//!
//! [`RendezvousBarrier::dispose`] poisons the barrier: every current and future
//! wait, master or slave, returns immediately. Invocations still queued for
//! the master are discarded.
//!
//! ## Roles
//!
//! The master role is a convention, not a type. The barrier does not check
//! which thread calls which side; the worker pool does.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::invocation::{MasterInvocation, PanicPayload};
use crate::error::{SyncError, SyncResult};

/// Lock-guarded round state.
struct BarrierState {
    /// Incremented by every open. Slaves wait for it to move.
    generation: u64,
    /// Whether a round is open and not yet closed by the master.
    open: bool,
    /// Poison flag.
    disposed: bool,
    /// Work queued for the master thread, FIFO.
    invocations: VecDeque<MasterInvocation>,
}

/// Master/slave rendezvous barrier with a master invocation queue.
pub struct RendezvousBarrier {
    slave_count: usize,
    /// Slaves that reached their post-work wait point this round.
    arrivals: AtomicUsize,
    state: Mutex<BarrierState>,
    /// Slaves park here until the next open.
    slaves_released: Condvar,
    /// The master parks here until every slave arrived or work was queued.
    master_wake: Condvar,
}

impl RendezvousBarrier {
    /// Creates a barrier for exactly `slave_count` slaves.
    #[must_use]
    pub fn new(slave_count: usize) -> Self {
        Self {
            slave_count,
            arrivals: AtomicUsize::new(0),
            state: Mutex::new(BarrierState {
                generation: 0,
                open: false,
                disposed: false,
                invocations: VecDeque::new(),
            }),
            slaves_released: Condvar::new(),
            master_wake: Condvar::new(),
        }
    }

    /// Number of slaves this barrier synchronizes.
    #[inline]
    #[must_use]
    pub const fn slave_count(&self) -> usize {
        self.slave_count
    }

    /// Slaves that have arrived at their reset wait in the current round.
    #[inline]
    #[must_use]
    pub fn arrivals(&self) -> usize {
        self.arrivals.load(Ordering::Acquire)
    }

    /// Whether the barrier has been poisoned.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Number of master invocations waiting to be serviced.
    #[must_use]
    pub fn pending_invocations(&self) -> usize {
        self.state.lock().invocations.len()
    }

    /// Releases every slave blocked in a slave-side wait and starts a round.
    ///
    /// # Panics
    ///
    /// Panics if the previous round was opened but never closed with
    /// [`RendezvousBarrier::master_wait_for_close`].
    pub fn master_open_barrier(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        assert!(
            !state.open,
            "Barrier opened twice! Call master_wait_for_close() before reopening."
        );
        self.arrivals.store(0, Ordering::Release);
        state.generation += 1;
        state.open = true;
        self.slaves_released.notify_all();
    }

    /// Blocks the master until all slaves reached their reset wait, then
    /// resets the arrival counter.
    ///
    /// Queued master invocations are serviced while waiting.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of a non-blocking master invocation serviced
    /// during the wait, after the round has closed.
    pub fn master_wait_for_close(&self) {
        if let Some(payload) = self.master_wait_for_close_servicing() {
            std::panic::resume_unwind(payload);
        }
    }

    /// [`RendezvousBarrier::master_wait_for_close`] that hands back the first
    /// non-blocking invocation panic instead of re-raising it.
    pub(crate) fn master_wait_for_close_servicing(&self) -> Option<PanicPayload> {
        let mut first_panic = None;
        let mut state = self.state.lock();
        loop {
            Self::drain_invocations(&mut state, &mut first_panic);
            if state.disposed || !state.open || self.arrivals() >= self.slave_count {
                break;
            }
            self.master_wake.wait(&mut state);
        }
        if state.open {
            state.open = false;
            self.arrivals.store(0, Ordering::Release);
        }
        first_panic
    }

    /// Blocks a slave until the first round has been opened.
    pub fn slave_wait_for_first_open(&self) {
        let mut state = self.state.lock();
        while state.generation == 0 && !state.disposed {
            self.slaves_released.wait(&mut state);
        }
    }

    /// Records this slave's arrival for the current round, then blocks until
    /// the next open.
    pub fn slave_wait_for_reset(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        let generation = state.generation;
        let arrived = self.arrivals.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived >= self.slave_count {
            self.master_wake.notify_all();
        }
        while state.generation == generation && !state.disposed {
            self.slaves_released.wait(&mut state);
        }
    }

    /// Queues work for the master thread and wakes it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Disposed`] if the barrier is poisoned; the
    /// invocation is dropped, disconnecting any blocking caller.
    pub fn queue_on_master(&self, invocation: MasterInvocation) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            drop(invocation);
            return Err(SyncError::Disposed);
        }
        state.invocations.push_back(invocation);
        self.master_wake.notify_all();
        Ok(())
    }

    /// Runs every queued master invocation on the calling thread.
    ///
    /// Returns the first panic raised by a non-blocking invocation.
    pub(crate) fn master_service_invocations(&self) -> Option<PanicPayload> {
        let mut first_panic = None;
        let mut state = self.state.lock();
        Self::drain_invocations(&mut state, &mut first_panic);
        first_panic
    }

    /// Parks the master for at most `timeout`, or until work is queued or
    /// [`RendezvousBarrier::notify_master`] is called.
    ///
    /// `keep_waiting` is evaluated under the barrier lock, so a wake issued
    /// after it returned `true` is never missed.
    pub(crate) fn master_wait_for_invocations(
        &self,
        timeout: Duration,
        keep_waiting: impl FnOnce() -> bool,
    ) {
        let mut state = self.state.lock();
        if state.invocations.is_empty() && !state.disposed && keep_waiting() {
            let _ = self.master_wake.wait_for(&mut state, timeout);
        }
    }

    /// Wakes a master parked in any master-side wait.
    pub(crate) fn notify_master(&self) {
        let _state = self.state.lock();
        self.master_wake.notify_all();
    }

    /// Poisons the barrier. Idempotent.
    pub fn dispose(&self) {
        let discarded = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            self.slaves_released.notify_all();
            self.master_wake.notify_all();
            std::mem::take(&mut state.invocations)
        };
        if !discarded.is_empty() {
            tracing::warn!(
                count = discarded.len(),
                "discarding master invocations queued on a disposed barrier"
            );
        }
    }

    /// Pops and runs invocations with the lock released around each one.
    fn drain_invocations(
        state: &mut MutexGuard<'_, BarrierState>,
        first_panic: &mut Option<PanicPayload>,
    ) {
        while let Some(invocation) = state.invocations.pop_front() {
            let outcome = MutexGuard::unlocked(state, || invocation.run());
            if let Err(payload) = outcome {
                if first_panic.is_none() {
                    *first_panic = Some(payload);
                }
            }
        }
    }
}

impl Drop for RendezvousBarrier {
    fn drop(&mut self) {
        self.dispose();
    }
}
