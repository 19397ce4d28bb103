//! # Tick Scheduler
//!
//! Drives registered modules at their own cadence on the master thread.
//!
//! ## State Machine
//!
//! ```text
//! NotStarted ──start()──► Running ──dispose()──► Stopping ──loop exits──► Stopped
//!     │                                                                     ▲
//!     └──────────────────────────dispose()──────────────────────────────────┘
//! ```
//!
//! ## One Pass
//!
//! ```text
//! for module in modules:
//!     if now >= next_due:
//!         module.pipeline_iterate(pool, now - last_tick)
//!         next_due += interval          (clamped to now when behind)
//!         service master invocations
//! service master invocations
//! park until the earliest next_due, or until work is queued
//! ```

use std::panic;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::module::PipelineModule;
use super::stats::ModuleStats;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::pool::WorkerPool;
use crate::sync::MasterInvocation;

/// Lifecycle of a [`TickScheduler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    /// Accepting modules; `start` not yet called.
    NotStarted,
    /// The loop is running on the master thread.
    Running,
    /// `dispose` was called; the loop exits after the current module.
    Stopping,
    /// The loop has exited and the worker pool has been released.
    Stopped,
}

type LifecycleHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LifecycleHooks {
    starting: Vec<LifecycleHook>,
    stopped: Vec<LifecycleHook>,
}

struct SchedulerShared {
    pool: WorkerPool,
    state: Mutex<SchedulerState>,
    master: Mutex<Option<ThreadId>>,
    hooks: Mutex<LifecycleHooks>,
}

impl SchedulerShared {
    fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    fn is_master_thread(&self) -> bool {
        *self.master.lock() == Some(thread::current().id())
    }

    /// Hooks are taken out before running so they may register more.
    fn run_hooks(&self, select: fn(&mut LifecycleHooks) -> &mut Vec<LifecycleHook>) {
        let hooks = std::mem::take(select(&mut self.hooks.lock()));
        for hook in hooks {
            hook();
        }
    }
}

/// Sets `Stopped` and releases the pool however the loop exits.
struct StopOnExit<'a> {
    shared: &'a SchedulerShared,
}

impl Drop for StopOnExit<'_> {
    fn drop(&mut self) {
        *self.shared.state.lock() = SchedulerState::Stopped;
        self.shared.pool.dispose();
        self.shared.pool.wait_for_slaves_to_exit();
        self.shared.run_hooks(|hooks| &mut hooks.stopped);
        tracing::info!("pipeline stopped");
    }
}

struct ModuleEntry {
    module: Box<dyn PipelineModule>,
    interval: Duration,
    last_tick: Instant,
    next_due: Instant,
    stats: ModuleStats,
}

impl ModuleEntry {
    /// Runs one iteration and advances `next_due`.
    ///
    /// Slow iterations are reported after the module returns; a module that
    /// never returns is not reported.
    fn iterate(
        &mut self,
        pool: &WorkerPool,
        now: Instant,
        slow_threshold: Duration,
    ) -> PipelineResult<()> {
        let delta = now.duration_since(self.last_tick);
        self.last_tick = now;

        self.module
            .pipeline_iterate(pool, delta)
            .map_err(|source| PipelineError::Module {
                name: self.stats.name().to_string(),
                source,
            })?;

        let iteration = now.elapsed();
        if self.stats.record(delta, iteration, slow_threshold) {
            tracing::warn!(
                module = self.stats.name(),
                iteration = ?iteration,
                threshold = ?slow_threshold,
                "slow module iteration"
            );
        }

        self.next_due += self.interval;
        let after = Instant::now();
        if self.next_due < after {
            self.next_due = after;
        }
        Ok(())
    }
}

/// Runs a fixed set of [`PipelineModule`]s on the thread that calls
/// [`TickScheduler::start`].
///
/// ## Usage
///
/// ```rust,ignore
/// let mut scheduler = TickScheduler::new(&PipelineConfig::load("orrery.toml")?)?;
/// scheduler.add_module(Physics::default())?;
/// scheduler.add_module(Render::default())?;
///
/// let handle = scheduler.handle();
/// // hand `handle` to other threads: invoke_on_master, dispose, ...
///
/// scheduler.start()?; // returns after handle.dispose()
/// ```
pub struct TickScheduler {
    shared: Arc<SchedulerShared>,
    modules: Vec<ModuleEntry>,
    slow_iteration_warning: Duration,
}

impl TickScheduler {
    /// Creates a scheduler and its worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Pool`] if the worker pool cannot be built.
    pub fn new(config: &PipelineConfig) -> PipelineResult<Self> {
        let pool = WorkerPool::new(config)?;
        Ok(Self {
            shared: Arc::new(SchedulerShared {
                pool,
                state: Mutex::new(SchedulerState::NotStarted),
                master: Mutex::new(None),
                hooks: Mutex::new(LifecycleHooks::default()),
            }),
            modules: Vec::new(),
            slow_iteration_warning: config.slow_iteration_warning(),
        })
    }

    /// Registers a module and calls its [`PipelineModule::module_added`] hook.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyStarted`] once the scheduler has left
    /// `NotStarted`, and [`PipelineError::DuplicateModule`] if a module with
    /// the same name is already registered.
    pub fn add_module<M>(&mut self, module: M) -> PipelineResult<()>
    where
        M: PipelineModule + 'static,
    {
        if self.shared.state() != SchedulerState::NotStarted {
            return Err(PipelineError::AlreadyStarted);
        }
        let name = module.name().to_string();
        if self.is_module_added(&name) {
            return Err(PipelineError::DuplicateModule(name));
        }

        let mut module: Box<dyn PipelineModule> = Box::new(module);
        module.module_added();
        let interval = module.tick_interval();
        tracing::debug!(module = %name, interval = ?interval, "module added");

        let now = Instant::now();
        self.modules.push(ModuleEntry {
            module,
            interval,
            last_tick: now,
            next_due: now + interval,
            stats: ModuleStats::new(name, interval),
        });
        Ok(())
    }

    /// Whether a module with `name` is registered.
    #[must_use]
    pub fn is_module_added(&self, name: &str) -> bool {
        self.modules.iter().any(|entry| entry.stats.name() == name)
    }

    /// Registers `hook` to run on the master thread when [`TickScheduler::start`]
    /// begins, before the first module iterates.
    pub fn on_starting<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.hooks.lock().starting.push(Box::new(hook));
    }

    /// Registers `hook` to run once the loop has exited and the worker pool's
    /// slaves have been joined, however the loop ended.
    ///
    /// Not run when the scheduler is disposed before it starts.
    pub fn on_stopped<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.hooks.lock().stopped.push(Box::new(hook));
    }

    /// Cloneable handle for other threads.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The worker pool modules dispatch onto.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Timing statistics, one entry per module in registration order.
    pub fn module_stats(&self) -> impl Iterator<Item = &ModuleStats> + '_ {
        self.modules.iter().map(|entry| &entry.stats)
    }

    /// Runs the loop on the calling thread, which becomes the master, until
    /// [`SchedulerHandle::dispose`] is called.
    ///
    /// The worker pool is disposed and its slaves joined before this returns,
    /// whether the loop ended normally, by error or by panic.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::NoModules`] if no module was added.
    /// - [`PipelineError::AlreadyStarted`] if the scheduler already ran.
    /// - [`PipelineError::Module`] if a module iteration failed.
    ///
    /// # Panics
    ///
    /// Re-raises panics from modules, from per-element work they dispatch,
    /// from non-blocking master invocations and from `on_starting` hooks.
    /// An `on_stopped` hook must not panic while another panic unwinds.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.modules.is_empty() {
            return Err(PipelineError::NoModules);
        }
        {
            let mut state = self.shared.state.lock();
            if *state != SchedulerState::NotStarted {
                return Err(PipelineError::AlreadyStarted);
            }
            *state = SchedulerState::Running;
        }
        *self.shared.master.lock() = Some(thread::current().id());
        self.shared.pool.bind_master_to_current();

        let shared = Arc::clone(&self.shared);
        let _stop = StopOnExit { shared: &shared };
        shared.run_hooks(|hooks| &mut hooks.starting);
        tracing::info!(
            modules = self.modules.len(),
            threads = shared.pool.num_threads(),
            "pipeline started"
        );

        self.run_loop()
    }

    fn run_loop(&mut self) -> PipelineResult<()> {
        let started = Instant::now();
        for entry in &mut self.modules {
            entry.last_tick = started;
            entry.next_due = started + entry.interval;
        }

        let shared = &self.shared;
        while shared.is_running() {
            for entry in &mut self.modules {
                if !shared.is_running() {
                    break;
                }
                let now = Instant::now();
                if now < entry.next_due {
                    continue;
                }
                entry.iterate(&shared.pool, now, self.slow_iteration_warning)?;
                shared.pool.service_master_invocations();
            }
            shared.pool.service_master_invocations();

            let Some(next_due) = self.modules.iter().map(|entry| entry.next_due).min() else {
                break;
            };
            let now = Instant::now();
            if next_due > now {
                shared
                    .pool
                    .wait_for_master_invocations(next_due - now, || shared.is_running());
            }
        }
        Ok(())
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.handle().dispose();
    }
}

/// Thread-safe handle to a [`TickScheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.shared.state()
    }

    /// Whether the calling thread is the scheduler's master thread.
    #[must_use]
    pub fn is_master_thread(&self) -> bool {
        self.shared.is_master_thread()
    }

    /// Runs `f` on the master thread and waits for its result.
    ///
    /// Runs inline when called on the master thread. Otherwise the caller
    /// blocks until the master services the request, which it does between
    /// module iterations and while waiting on the worker pool, so calling
    /// this from per-element work cannot stall the loop.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::NotRunning`] before `start`.
    /// - [`PipelineError::Disposed`] after the scheduler stopped, or if it
    ///   stopped before `f` ran.
    ///
    /// # Panics
    ///
    /// A panic raised by `f` is re-raised on the calling thread.
    pub fn invoke_on_master<F, T>(&self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.check_accepting()?;
        if self.is_master_thread() {
            return Ok(f());
        }

        let (invocation, reply) = MasterInvocation::blocking(f);
        self.shared
            .pool
            .queue_on_master(invocation)
            .map_err(|_| PipelineError::Disposed)?;
        match reply.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(PipelineError::Disposed),
        }
    }

    /// Queues `f` for the master thread without waiting.
    ///
    /// Runs inline when called on the master thread. A panic raised by `f`
    /// is fatal to the loop: it is re-raised from [`TickScheduler::start`].
    ///
    /// # Errors
    ///
    /// Same as [`SchedulerHandle::invoke_on_master`]. Invocations still
    /// queued when the scheduler stops are discarded.
    pub fn invoke_on_master_async<F>(&self, f: F) -> PipelineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_accepting()?;
        if self.is_master_thread() {
            f();
            return Ok(());
        }

        self.shared
            .pool
            .queue_on_master(MasterInvocation::non_blocking(f))
            .map_err(|_| PipelineError::Disposed)
    }

    /// Stops the loop after the module currently iterating returns.
    ///
    /// Before `start`, moves straight to `Stopped` and releases the pool.
    /// Idempotent.
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock();
        match *state {
            SchedulerState::Running => {
                *state = SchedulerState::Stopping;
                drop(state);
                tracing::debug!("pipeline stop requested");
                self.shared.pool.wake_master();
            }
            SchedulerState::NotStarted => {
                *state = SchedulerState::Stopped;
                drop(state);
                self.shared.pool.dispose();
                self.shared.pool.wait_for_slaves_to_exit();
            }
            SchedulerState::Stopping | SchedulerState::Stopped => {}
        }
    }

    fn check_accepting(&self) -> PipelineResult<()> {
        match self.state() {
            SchedulerState::NotStarted => Err(PipelineError::NotRunning),
            SchedulerState::Running | SchedulerState::Stopping => Ok(()),
            SchedulerState::Stopped => Err(PipelineError::Disposed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;

    struct Named(&'static str);

    impl PipelineModule for Named {
        fn tick_interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn name(&self) -> &str {
            self.0
        }

        fn pipeline_iterate(&mut self, _: &WorkerPool, _: Duration) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    #[test]
    fn test_new_scheduler_not_started() {
        let scheduler = TickScheduler::new(&PipelineConfig::with_thread_count(2)).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::NotStarted);
        assert_eq!(scheduler.pool().num_threads(), 2);
        assert_eq!(scheduler.module_stats().count(), 0);
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let mut scheduler = TickScheduler::new(&PipelineConfig::single_threaded()).unwrap();
        scheduler.add_module(Named("physics")).unwrap();
        scheduler.add_module(Named("render")).unwrap();

        let result = scheduler.add_module(Named("physics"));
        assert!(matches!(result, Err(PipelineError::DuplicateModule(name)) if name == "physics"));

        let names: Vec<_> = scheduler.module_stats().map(ModuleStats::name).collect();
        assert_eq!(names, ["physics", "render"]);
    }

    #[test]
    fn test_add_after_dispose_rejected() {
        let mut scheduler = TickScheduler::new(&PipelineConfig::single_threaded()).unwrap();
        scheduler.handle().dispose();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(scheduler.pool().is_disposed());

        let result = scheduler.add_module(Named("late"));
        assert!(matches!(result, Err(PipelineError::AlreadyStarted)));
    }

    #[test]
    fn test_invoke_before_start_not_running() {
        let scheduler = TickScheduler::new(&PipelineConfig::single_threaded()).unwrap();
        let handle = scheduler.handle();
        assert!(matches!(
            handle.invoke_on_master(|| 1),
            Err(PipelineError::NotRunning)
        ));
        assert!(matches!(
            handle.invoke_on_master_async(|| {}),
            Err(PipelineError::NotRunning)
        ));
        assert!(!handle.is_master_thread());
    }
}
