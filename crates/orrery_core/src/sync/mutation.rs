//! # Mutation Guard
//!
//! Freeze/permit primitive for long-lived shared state.
//!
//! Any number of threads may hold a [`MutationPermit`] concurrently. The
//! owner of the state calls [`MutationGuard::freeze_mutations`] to block new
//! permits and drain the outstanding ones, does its exclusive work, then
//! calls [`MutationGuard::unfreeze_mutations`].
//!
//! ```rust,ignore
//! {
//!     let _permit = guard.acquire_permit()?;
//!     // mutate shared state
//! }
//!
//! guard.freeze_mutations()?;
//! // swap / snapshot shared state
//! guard.unfreeze_mutations();
//! ```
//!
//! A permit can also carry an entity's own mutex for its lifetime with
//! [`MutationGuard::acquire_permit_with`].

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{SyncError, SyncResult};

/// How often a servicing freeze re-runs its service hook while permits drain,
/// and how often a locked acquire rechecks for an interrupt.
const SERVICE_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Permits held by this thread, per guard id.
    static HELD_PERMITS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

fn note_acquired(guard_id: u64) {
    HELD_PERMITS.with(|held| {
        let mut held = held.borrow_mut();
        match held.iter_mut().find(|(id, _)| *id == guard_id) {
            Some((_, count)) => *count += 1,
            None => held.push((guard_id, 1)),
        }
    });
}

fn note_released(guard_id: u64) {
    HELD_PERMITS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(position) = held.iter().position(|(id, _)| *id == guard_id) {
            held[position].1 -= 1;
            if held[position].1 == 0 {
                held.swap_remove(position);
            }
        }
    });
}

fn holds_permit(guard_id: u64) -> bool {
    HELD_PERMITS.with(|held| held.borrow().iter().any(|(id, _)| *id == guard_id))
}

struct GuardState {
    active_permits: usize,
    frozen: bool,
    frozen_by: Option<ThreadId>,
    interrupted: bool,
}

/// Lets many mutators proceed while supporting a global freeze-and-drain.
pub struct MutationGuard {
    id: u64,
    state: Mutex<GuardState>,
    /// Blocked `acquire_permit` calls wait here.
    unfrozen: Condvar,
    /// A pending freeze waits here for the permit count to reach zero.
    drained: Condvar,
}

impl MutationGuard {
    /// Creates an unfrozen guard with no outstanding permits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(GuardState {
                active_permits: 0,
                frozen: false,
                frozen_by: None,
                interrupted: false,
            }),
            unfrozen: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Advisory snapshot: whether mutations are currently frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    /// Number of permits currently outstanding.
    #[must_use]
    pub fn active_permits(&self) -> usize {
        self.state.lock().active_permits
    }

    /// Whether [`MutationGuard::interrupt`] has been called.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Returns a permit to mutate guarded state, blocking while frozen.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Interrupted`] if the guard is interrupted while
    /// (or before) this call has to wait.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread froze this guard itself.
    pub fn acquire_permit(&self) -> SyncResult<MutationPermit<'_>> {
        let current = thread::current().id();
        let mut state = self.state.lock();
        assert!(
            state.frozen_by != Some(current),
            "Can not acquire permit: mutations are frozen by the current thread."
        );
        while state.frozen {
            if state.interrupted {
                return Err(SyncError::Interrupted);
            }
            self.unfrozen.wait(&mut state);
        }
        state.active_permits += 1;
        drop(state);

        Ok(self.issue_permit())
    }

    /// Returns a permit if mutations are not frozen, without blocking.
    #[must_use]
    pub fn try_acquire_permit(&self) -> Option<MutationPermit<'_>> {
        let mut state = self.state.lock();
        if state.frozen {
            return None;
        }
        state.active_permits += 1;
        drop(state);

        Some(self.issue_permit())
    }

    /// Returns a permit that also holds `lock` until it is dropped.
    ///
    /// The lock is entered after the permit is granted and released before
    /// the permit is returned to the guard.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Interrupted`] if the guard is interrupted while
    /// this call waits for the permit or for `lock`. A permit granted before
    /// the interrupt is returned to the guard.
    ///
    /// # Panics
    ///
    /// Same as [`MutationGuard::acquire_permit`].
    pub fn acquire_permit_with<'a, T>(
        &'a self,
        lock: &'a Mutex<T>,
    ) -> SyncResult<LockedPermit<'a, T>> {
        let permit = self.acquire_permit()?;
        loop {
            if let Some(data) = lock.try_lock_for(SERVICE_INTERVAL) {
                return Ok(LockedPermit { data, permit });
            }
            if self.is_interrupted() {
                return Err(SyncError::Interrupted);
            }
        }
    }

    /// Blocks new permits, then waits until every outstanding permit is
    /// disposed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Interrupted`] if the guard is interrupted while
    /// draining. The freeze is rolled back in that case.
    ///
    /// # Panics
    ///
    /// Panics if mutations are already frozen, or if the calling thread holds
    /// a permit from this guard (it would wait on itself forever).
    pub fn freeze_mutations(&self) -> SyncResult<()> {
        self.freeze(None)
    }

    /// [`MutationGuard::freeze_mutations`] that keeps calling `service` while
    /// permits drain.
    ///
    /// Used on the master thread so permit holders blocked on master work
    /// can still finish.
    pub(crate) fn freeze_mutations_servicing(&self, service: &mut dyn FnMut()) -> SyncResult<()> {
        self.freeze(Some(service))
    }

    fn freeze(&self, mut service: Option<&mut dyn FnMut()>) -> SyncResult<()> {
        assert!(
            !holds_permit(self.id),
            "Can not freeze mutations: the current thread still holds a mutation permit."
        );
        let mut state = self.state.lock();
        assert!(!state.frozen, "Mutations are already frozen!");
        state.frozen = true;
        state.frozen_by = Some(thread::current().id());

        while state.active_permits > 0 {
            if state.interrupted {
                Self::thaw(&mut state);
                self.unfrozen.notify_all();
                return Err(SyncError::Interrupted);
            }
            match service.as_mut() {
                Some(service) => {
                    MutexGuard::unlocked(&mut state, || service());
                    if state.active_permits > 0 && !state.interrupted {
                        let _ = self.drained.wait_for(&mut state, SERVICE_INTERVAL);
                    }
                }
                None => self.drained.wait(&mut state),
            }
        }
        Ok(())
    }

    /// Clears the frozen flag and wakes blocked `acquire_permit` calls.
    ///
    /// # Panics
    ///
    /// Panics if mutations are not frozen.
    pub fn unfreeze_mutations(&self) {
        let mut state = self.state.lock();
        assert!(state.frozen, "Mutations are not currently frozen!");
        Self::thaw(&mut state);
        self.unfrozen.notify_all();
    }

    /// Wakes every blocked wait on this guard with [`SyncError::Interrupted`].
    ///
    /// Sticky: later calls that would block also fail. Calls that can
    /// proceed without waiting are unaffected.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.unfrozen.notify_all();
        self.drained.notify_all();
    }

    fn thaw(state: &mut GuardState) {
        state.frozen = false;
        state.frozen_by = None;
    }

    fn issue_permit(&self) -> MutationPermit<'_> {
        note_acquired(self.id);
        MutationPermit {
            guard: self,
            disposed: false,
            _not_send: PhantomData,
        }
    }

    fn release_permit(&self) {
        note_released(self.id);
        let mut state = self.state.lock();
        assert!(state.active_permits > 0, "mutation permit count underflow");
        state.active_permits -= 1;
        if state.active_permits == 0 {
            self.drained.notify_all();
        }
    }
}

impl Default for MutationGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// The right to mutate state guarded by a [`MutationGuard`].
///
/// Released on drop, or explicitly with [`MutationPermit::dispose`]. Permits
/// stay on the thread that acquired them.
#[must_use = "dropping a permit immediately releases it"]
pub struct MutationPermit<'a> {
    guard: &'a MutationGuard,
    disposed: bool,
    _not_send: PhantomData<*const ()>,
}

impl MutationPermit<'_> {
    /// Releases the permit now.
    ///
    /// # Panics
    ///
    /// Panics if this permit was already disposed.
    pub fn dispose(&mut self) {
        assert!(
            !self.disposed,
            "Can not dispose the same mutation permit more than once!"
        );
        self.disposed = true;
        self.guard.release_permit();
    }

    /// Whether [`MutationPermit::dispose`] has been called.
    #[inline]
    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for MutationPermit<'_> {
    fn drop(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.guard.release_permit();
        }
    }
}

/// A [`MutationPermit`] paired with a held lock on the entity it mutates.
///
/// Dereferences to the locked data. The lock is released before the permit.
pub struct LockedPermit<'a, T> {
    data: MutexGuard<'a, T>,
    permit: MutationPermit<'a>,
}

impl<T> LockedPermit<'_, T> {
    /// The underlying permit.
    #[must_use]
    pub fn permit(&self) -> &MutationPermit<'_> {
        &self.permit
    }
}

impl<T> Deref for LockedPermit<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for LockedPermit<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_acquire_when_not_frozen() {
        let guard = MutationGuard::new();
        let permit = guard.acquire_permit().unwrap();
        assert_eq!(guard.active_permits(), 1);
        assert!(!guard.is_frozen());
        drop(permit);
        assert_eq!(guard.active_permits(), 0);
    }

    #[test]
    fn test_permit_holds_lock() {
        let guard = MutationGuard::new();
        let entity = Mutex::new(5_u32);
        {
            let mut permit = guard.acquire_permit_with(&entity).unwrap();
            assert!(entity.is_locked());
            assert!(!permit.permit().is_disposed());
            *permit += 1;
        }
        assert!(!entity.is_locked());
        assert_eq!(*entity.lock(), 6);
        assert_eq!(guard.active_permits(), 0);
    }

    #[test]
    fn test_interrupt_releases_blocked_lock_wait() {
        let guard = Arc::new(MutationGuard::new());
        let entity = Arc::new(Mutex::new(0_u32));
        let held = entity.lock();

        let waiter = {
            let guard = Arc::clone(&guard);
            let entity = Arc::clone(&entity);
            thread::spawn(move || guard.acquire_permit_with(&entity).map(drop))
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());
        assert_eq!(guard.active_permits(), 1);

        guard.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
        assert_eq!(guard.active_permits(), 0);
        drop(held);
    }

    #[test]
    #[should_panic(expected = "Can not dispose the same mutation permit more than once")]
    fn test_double_dispose_panics() {
        let guard = MutationGuard::new();
        let mut permit = guard.acquire_permit().unwrap();
        permit.dispose();
        permit.dispose();
    }

    #[test]
    fn test_freeze_and_unfreeze() {
        let guard = MutationGuard::new();
        guard.freeze_mutations().unwrap();
        assert!(guard.is_frozen());
        assert!(guard.try_acquire_permit().is_none());
        guard.unfreeze_mutations();
        assert!(!guard.is_frozen());
        assert!(guard.try_acquire_permit().is_some());
    }

    #[test]
    fn test_freeze_waits_for_outstanding_permit() {
        let guard = Arc::new(MutationGuard::new());
        let frozen = Arc::new(AtomicBool::new(false));
        let (acquired_tx, acquired_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let holder = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                let permit = guard.acquire_permit().unwrap();
                acquired_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                drop(permit);
            })
        };
        acquired_rx.recv().unwrap();

        let freezer = {
            let guard = Arc::clone(&guard);
            let frozen = Arc::clone(&frozen);
            thread::spawn(move || {
                guard.freeze_mutations().unwrap();
                frozen.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(!frozen.load(Ordering::SeqCst));
        assert!(guard.is_frozen());

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        freezer.join().unwrap();
        assert!(frozen.load(Ordering::SeqCst));
        assert_eq!(guard.active_permits(), 0);
    }

    #[test]
    fn test_freeze_on_other_thread_persists() {
        let guard = Arc::new(MutationGuard::new());
        {
            let guard = Arc::clone(&guard);
            thread::spawn(move || guard.freeze_mutations().unwrap())
                .join()
                .unwrap();
        }
        assert!(guard.is_frozen());
        guard.unfreeze_mutations();
        assert!(!guard.is_frozen());
    }

    #[test]
    fn test_blocked_acquire_resumes_on_unfreeze() {
        let guard = Arc::new(MutationGuard::new());
        guard.freeze_mutations().unwrap();

        let waiter = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || guard.acquire_permit().map(drop))
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        guard.unfreeze_mutations();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_interrupt_releases_blocked_acquire() {
        let guard = Arc::new(MutationGuard::new());
        guard.freeze_mutations().unwrap();

        let waiter = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || guard.acquire_permit().map(drop))
        };

        thread::sleep(Duration::from_millis(100));
        guard.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
        assert!(guard.is_interrupted());
        assert!(guard.is_frozen());
    }

    #[test]
    fn test_interrupt_rolls_back_pending_freeze() {
        let guard = Arc::new(MutationGuard::new());
        let permit = guard.acquire_permit().unwrap();

        let freezer = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || guard.freeze_mutations())
        };

        thread::sleep(Duration::from_millis(100));
        guard.interrupt();
        assert_eq!(freezer.join().unwrap(), Err(SyncError::Interrupted));
        assert!(!guard.is_frozen());
        drop(permit);
    }

    #[test]
    #[should_panic(expected = "still holds a mutation permit")]
    fn test_freeze_while_holding_permit_panics() {
        let guard = MutationGuard::new();
        let _permit = guard.acquire_permit().unwrap();
        let _ = guard.freeze_mutations();
    }

    #[test]
    #[should_panic(expected = "frozen by the current thread")]
    fn test_acquire_after_own_freeze_panics() {
        let guard = MutationGuard::new();
        guard.freeze_mutations().unwrap();
        let _ = guard.acquire_permit();
    }

    #[test]
    fn test_servicing_freeze_runs_hook() {
        let guard = Arc::new(MutationGuard::new());
        let permit_guard = Arc::clone(&guard);
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (acquired_tx, acquired_rx) = crossbeam_channel::bounded(0);

        let holder = thread::spawn(move || {
            let _permit = permit_guard.acquire_permit().unwrap();
            acquired_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        acquired_rx.recv().unwrap();

        let mut serviced = 0_u32;
        guard
            .freeze_mutations_servicing(&mut || {
                serviced += 1;
                if serviced == 3 {
                    release_tx.send(()).unwrap();
                }
            })
            .unwrap();

        assert!(serviced >= 3);
        holder.join().unwrap();
        guard.unfreeze_mutations();
    }
}
