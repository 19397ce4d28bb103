//! # ORRERY Core
//!
//! Concurrency core for a real-time simulation engine:
//! - Fixed-topology worker pool with fork-join `execute` and `invoke_on_all`
//! - Reusable master/slave rendezvous barrier
//! - Freeze/permit mutation guard
//! - Tick scheduler driving independently clocked modules
//!
//! ## Architecture Rules
//!
//! 1. **One master thread** - Only the master dispatches, broadcasts or freezes
//! 2. **Persistent slaves** - Threads are spawned once and parked between dispatches
//! 3. **No stalls** - Every master-side wait services queued master invocations
//! 4. **Dispose never deadlocks** - Disposal releases every current and future waiter
//!
//! ## Example
//!
//! ```rust,ignore
//! use orrery_core::{PipelineConfig, TickScheduler};
//!
//! let mut scheduler = TickScheduler::new(&PipelineConfig::default())?;
//! scheduler.add_module(Physics::new())?;
//! scheduler.start()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod sync;

pub use config::PipelineConfig;
pub use error::{
    ConfigError, ModuleError, PipelineError, PipelineResult, PoolError, PoolResult, SyncError,
    SyncResult,
};
pub use pipeline::{ModuleStats, PipelineModule, SchedulerHandle, SchedulerState, TickScheduler};
pub use pool::WorkerPool;
pub use sync::{
    LockedPermit, MasterInvocation, MutationGuard, MutationPermit, PanicPayload,
    RendezvousBarrier,
};
