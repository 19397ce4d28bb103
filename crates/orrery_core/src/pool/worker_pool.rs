//! # Worker Pool
//!
//! Fixed set of persistent slave threads driven by one master thread.
//!
//! ```text
//! master:  execute(N, b, f)
//!            │ publish job, open barrier
//!            ├──────────────┬──────────────┬─────────────┐
//!            ▼              ▼              ▼             ▼
//!         master         slave 0        slave 1  ...  slave S-1
//!         claims blocks  claims blocks  claims blocks
//!            │              │              │             │
//!            │   wait_for_close (services master invocations)
//!            ◄──────────────┴──────────────┴─────────────┘
//!            │ seal job, re-raise first panic
//!            ▼
//!          returns
//! ```
//!
//! Blocks are claimed through a shared atomic counter, so fast threads take
//! more blocks than slow ones. Elements inside one block always run in
//! ascending order on a single thread.

use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use super::job::Job;
use crate::config::PipelineConfig;
use crate::error::{PoolError, PoolResult, SyncResult};
use crate::sync::{MasterInvocation, MutationGuard, RendezvousBarrier};

/// State shared between the pool handle and its slaves.
struct PoolShared {
    barrier: RendezvousBarrier,
    /// Job of the round in progress; set before open, cleared after close.
    current: Mutex<Option<Arc<Job>>>,
    shutdown: AtomicBool,
}

/// Clears the reentrancy flag when a dispatch ends, even by panic.
struct DispatchScope<'a>(&'a AtomicBool);

impl Drop for DispatchScope<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fork-join pool of persistent slave threads.
///
/// ## Usage
///
/// ```rust,ignore
/// let pool = WorkerPool::new(&PipelineConfig::default())?;
///
/// let positions: Vec<AtomicU32> = ...;
/// pool.execute(positions.len(), 256, |i| {
///     positions[i].fetch_add(1, Ordering::Relaxed);
/// })?;
///
/// pool.invoke_on_all(|| reset_thread_scratch(), true)?;
/// ```
///
/// Dispatch operations may only be called from the master thread, which is
/// the constructing thread until [`WorkerPool::bind_master_to_current`]
/// moves it.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    num_threads: usize,
    master: Mutex<ThreadId>,
    slaves: Mutex<Vec<JoinHandle<()>>>,
    force_single_threaded: AtomicBool,
    dispatching: AtomicBool,
}

impl WorkerPool {
    /// Spawns `config.thread_count() - 1` slaves; the calling thread becomes
    /// the master.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a slave thread cannot be created. Any
    /// slaves already started are shut down first.
    pub fn new(config: &PipelineConfig) -> PoolResult<Self> {
        let num_threads = config.thread_count();
        let slave_count = num_threads - 1;

        let pool = Self {
            shared: Arc::new(PoolShared {
                barrier: RendezvousBarrier::new(slave_count),
                current: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
            num_threads,
            master: Mutex::new(thread::current().id()),
            slaves: Mutex::new(Vec::with_capacity(slave_count)),
            force_single_threaded: AtomicBool::new(config.force_single_threaded),
            dispatching: AtomicBool::new(false),
        };

        for index in 0..slave_count {
            let handle = pool.spawn_slave(config, index)?;
            pool.slaves.lock().push(handle);
        }

        tracing::info!(
            threads = num_threads,
            slaves = slave_count,
            single_threaded = config.force_single_threaded,
            "worker pool started"
        );
        Ok(pool)
    }

    fn spawn_slave(&self, config: &PipelineConfig, index: usize) -> PoolResult<JoinHandle<()>> {
        let mut builder =
            thread::Builder::new().name(format!("{}-{index}", config.slave_name_prefix));
        if let Some(stack_size) = config.slave_stack_size {
            builder = builder.stack_size(stack_size);
        }
        let shared = Arc::clone(&self.shared);
        builder
            .spawn(move || slave_loop(&shared, index))
            .map_err(|source| PoolError::Spawn { index, source })
    }

    /// Total threads taking part in a dispatch, master included.
    #[inline]
    #[must_use]
    pub const fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Number of slave threads.
    #[inline]
    #[must_use]
    pub const fn slave_count(&self) -> usize {
        self.num_threads - 1
    }

    /// Whether the calling thread holds master authority.
    #[must_use]
    pub fn is_master_thread(&self) -> bool {
        *self.master.lock() == thread::current().id()
    }

    /// Makes the calling thread the master.
    ///
    /// # Panics
    ///
    /// Panics if called while a dispatch is in progress.
    pub fn bind_master_to_current(&self) {
        assert!(
            !self.dispatching.load(Ordering::Acquire),
            "Can not move master authority during a dispatch."
        );
        *self.master.lock() = thread::current().id();
    }

    /// Whether dispatch is forced onto the calling thread.
    #[must_use]
    pub fn is_single_threaded(&self) -> bool {
        self.force_single_threaded.load(Ordering::Acquire)
    }

    /// Forces every subsequent dispatch to run sequentially on the master,
    /// in ascending index order. Used for deterministic verification.
    pub fn set_force_single_threaded(&self, force: bool) {
        self.force_single_threaded.store(force, Ordering::Release);
    }

    /// Whether [`WorkerPool::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Calls `work(i)` exactly once for every `i` in `[0, total)`, fanning
    /// blocks of `block_size` indices out across the pool.
    ///
    /// Blocks until every element has run. If a callback panics, the first
    /// panic is re-raised here once all in-flight blocks have settled.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Disposed`] if the pool was disposed before or
    /// during the call. Elements may have been only partially processed.
    ///
    /// # Panics
    ///
    /// Panics if called off the master thread, from inside another dispatch,
    /// or with a zero `block_size`.
    pub fn execute<F>(&self, total: usize, block_size: usize, work: F) -> PoolResult<()>
    where
        F: Fn(usize) + Sync,
    {
        self.assert_master("execute");
        assert!(block_size > 0, "execute requires a positive block size");
        let _scope = self.begin_dispatch();

        if self.is_disposed() {
            return Err(PoolError::Disposed);
        }
        if total == 0 {
            return Ok(());
        }
        if self.is_single_threaded() {
            (0..total).for_each(&work);
            return Ok(());
        }

        // SAFETY: dispatch() seals the job before returning; `work` outlives it.
        #[allow(unsafe_code)]
        let job = unsafe { Job::blocks(&work, total, block_size) };
        self.dispatch(job, true)
    }

    /// Runs `action` once on every slave and, if `include_calling_thread`,
    /// once on the master. Blocks until every invocation finished.
    ///
    /// In single-threaded mode `action` runs once on the caller when
    /// `include_calling_thread` is set, and not at all otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Disposed`] if the pool was disposed before or
    /// during the call.
    ///
    /// # Panics
    ///
    /// Same as [`WorkerPool::execute`]; panics raised by `action` propagate.
    pub fn invoke_on_all<F>(&self, action: F, include_calling_thread: bool) -> PoolResult<()>
    where
        F: Fn() + Sync,
    {
        self.assert_master("invoke_on_all");
        let _scope = self.begin_dispatch();

        if self.is_disposed() {
            return Err(PoolError::Disposed);
        }
        if self.is_single_threaded() {
            if include_calling_thread {
                action();
            }
            return Ok(());
        }

        // SAFETY: dispatch() seals the job before returning; `action` outlives it.
        #[allow(unsafe_code)]
        let job = unsafe { Job::broadcast(&action) };
        self.dispatch(job, include_calling_thread)
    }

    fn dispatch(&self, job: Job, master_participates: bool) -> PoolResult<()> {
        tracing::trace!(slaves = self.slave_count(), master_participates, "dispatching job");
        let job = Arc::new(job);
        *self.shared.current.lock() = Some(Arc::clone(&job));

        self.shared.barrier.master_open_barrier();
        if master_participates {
            job.participate();
        }
        let invocation_panic = self.shared.barrier.master_wait_for_close_servicing();
        job.seal_and_wait();
        self.shared.current.lock().take();

        if let Some(payload) = job.take_panic() {
            panic::resume_unwind(payload);
        }
        if let Some(payload) = invocation_panic {
            panic::resume_unwind(payload);
        }
        if job.is_halted() {
            return Err(PoolError::Disposed);
        }
        Ok(())
    }

    /// Queues work for the master thread.
    ///
    /// Serviced during any master-side wait of an in-progress dispatch, or
    /// at the next [`WorkerPool::service_master_invocations`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Disposed`](crate::SyncError::Disposed) once the
    /// pool is disposed.
    pub fn queue_on_master(&self, invocation: MasterInvocation) -> SyncResult<()> {
        self.shared.barrier.queue_on_master(invocation)
    }

    /// Runs every queued master invocation now.
    ///
    /// # Panics
    ///
    /// Panics off the master thread, and re-raises the first panic of a
    /// non-blocking invocation after the queue has drained.
    pub fn service_master_invocations(&self) {
        self.assert_master("service_master_invocations");
        if let Some(payload) = self.shared.barrier.master_service_invocations() {
            panic::resume_unwind(payload);
        }
    }

    /// Freezes `guard`, servicing master invocations while permits drain so
    /// permit holders waiting on the master can finish.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Interrupted`](crate::SyncError::Interrupted) if
    /// the guard is interrupted while draining.
    ///
    /// # Panics
    ///
    /// Panics off the master thread, on the preconditions of
    /// [`MutationGuard::freeze_mutations`], and re-raises the first panic of
    /// a non-blocking invocation serviced during the wait. The guard is left
    /// unfrozen in that last case.
    pub fn freeze_mutations(&self, guard: &MutationGuard) -> SyncResult<()> {
        self.assert_master("freeze_mutations");
        let mut first_panic = None;
        let result = guard.freeze_mutations_servicing(&mut || {
            if let Some(payload) = self.shared.barrier.master_service_invocations() {
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        });
        if let Some(payload) = first_panic {
            if result.is_ok() {
                guard.unfreeze_mutations();
            }
            panic::resume_unwind(payload);
        }
        result
    }

    /// Parks the master for up to `timeout` or until work is queued, unless
    /// `keep_waiting` returns `false`.
    pub(crate) fn wait_for_master_invocations(
        &self,
        timeout: Duration,
        keep_waiting: impl FnOnce() -> bool,
    ) {
        self.shared
            .barrier
            .master_wait_for_invocations(timeout, keep_waiting);
    }

    /// Wakes the master out of [`WorkerPool::wait_for_master_invocations`].
    pub(crate) fn wake_master(&self) {
        self.shared.barrier.notify_master();
    }

    /// Signals shutdown to every slave and aborts any dispatch in flight.
    ///
    /// Idempotent. No current or future call can deadlock afterwards:
    /// dispatches return [`PoolError::Disposed`] and queued master
    /// invocations are discarded.
    pub fn dispose(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(job) = self.shared.current.lock().as_ref() {
            job.halt();
        }
        self.shared.barrier.dispose();
        tracing::debug!(slaves = self.slave_count(), "worker pool disposed");
    }

    /// Blocks until every slave thread has terminated.
    ///
    /// # Panics
    ///
    /// Panics if the pool has not been disposed, since the slaves would
    /// never exit.
    pub fn wait_for_slaves_to_exit(&self) {
        assert!(
            self.is_disposed(),
            "Can not wait for slaves to exit before the pool is disposed."
        );
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.slaves.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("slave thread terminated by a panic");
            }
        }
    }

    fn assert_master(&self, operation: &str) {
        assert!(
            self.is_master_thread(),
            "{operation} must be called from the master thread"
        );
    }

    fn begin_dispatch(&self) -> DispatchScope<'_> {
        assert!(
            !self.dispatching.swap(true, Ordering::AcqRel),
            "Reentrant dispatch: execute/invoke_on_all called while another dispatch is running."
        );
        DispatchScope(&self.dispatching)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispose();
        self.wait_for_slaves_to_exit();
    }
}

fn slave_loop(shared: &PoolShared, index: usize) {
    tracing::trace!(slave = index, "slave parked");
    shared.barrier.slave_wait_for_first_open();
    while !shared.shutdown.load(Ordering::Acquire) {
        let job = shared.current.lock().clone();
        if let Some(job) = job {
            job.participate();
        }
        shared.barrier.slave_wait_for_reset();
    }
    tracing::debug!(slave = index, "slave observed shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_counts() {
        let pool = WorkerPool::new(&PipelineConfig::with_thread_count(3)).unwrap();
        assert_eq!(pool.num_threads(), 3);
        assert_eq!(pool.slave_count(), 2);
        assert!(pool.is_master_thread());
    }

    #[test]
    fn test_slave_names_use_prefix() {
        let config = PipelineConfig {
            slave_name_prefix: "pool-test".to_string(),
            ..PipelineConfig::with_thread_count(3)
        };
        let pool = WorkerPool::new(&config).unwrap();
        let names = pool
            .slaves
            .lock()
            .iter()
            .map(|handle| handle.thread().name().map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![Some("pool-test-0".to_string()), Some("pool-test-1".to_string())]
        );
    }

    #[test]
    fn test_only_master_thread_dispatches_without_slaves() {
        let pool = WorkerPool::new(&PipelineConfig::single_threaded()).unwrap();
        assert_eq!(pool.slave_count(), 0);

        let sum = AtomicUsize::new(0);
        pool.execute(10, 3, |i| {
            sum.fetch_add(i, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(sum.load(Ordering::Relaxed), 45);
    }

    #[test]
    #[should_panic(expected = "Reentrant dispatch")]
    fn test_reentrant_execute_panics() {
        let pool = WorkerPool::new(&PipelineConfig::single_threaded()).unwrap();
        pool.set_force_single_threaded(true);
        pool.execute(1, 1, |_| {
            let _ = pool.execute(1, 1, |_| {});
        })
        .unwrap();
    }

    #[test]
    fn test_dispatch_flag_cleared_after_panic() {
        let pool = WorkerPool::new(&PipelineConfig::with_thread_count(2)).unwrap();
        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            pool.execute(4, 1, |_| panic!("boom")).unwrap();
        }));
        assert!(outcome.is_err());
        assert!(!pool.dispatching.load(Ordering::Acquire));
        pool.execute(4, 1, |_| {}).unwrap();
    }

    #[test]
    fn test_service_runs_queued_invocations() {
        let pool = WorkerPool::new(&PipelineConfig::with_thread_count(2)).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.queue_on_master(MasterInvocation::non_blocking(move || {
            flag.store(true, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        pool.service_master_invocations();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_freeze_services_permit_holder() {
        let pool = Arc::new(WorkerPool::new(&PipelineConfig::with_thread_count(2)).unwrap());
        let guard = Arc::new(MutationGuard::new());
        let (acquired_tx, acquired_rx) = crossbeam_channel::bounded(0);

        let holder = {
            let pool = Arc::clone(&pool);
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                let _permit = guard.acquire_permit().unwrap();
                acquired_tx.send(()).unwrap();
                // Needs the master while holding the permit.
                let (invocation, reply) = MasterInvocation::blocking(|| 11);
                pool.queue_on_master(invocation).unwrap();
                reply.recv().unwrap().unwrap()
            })
        };
        acquired_rx.recv().unwrap();

        pool.freeze_mutations(&guard).unwrap();
        assert!(guard.is_frozen());
        guard.unfreeze_mutations();
        assert_eq!(holder.join().unwrap(), 11);
    }

    #[test]
    #[should_panic(expected = "before the pool is disposed")]
    fn test_wait_before_dispose_panics() {
        let pool = WorkerPool::new(&PipelineConfig::with_thread_count(2)).unwrap();
        pool.wait_for_slaves_to_exit();
    }
}
