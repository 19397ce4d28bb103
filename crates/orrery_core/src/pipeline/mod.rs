//! # Tick Pipeline
//!
//! The top-level loop. A [`TickScheduler`] owns the master thread for the
//! session, iterates each [`PipelineModule`] when its interval has elapsed,
//! and services work queued through a [`SchedulerHandle`] from any thread.
//!
//! Modules are not clocked in lockstep: a 10ms module and a 16ms module
//! registered together each see their own cadence and their own delta.

mod module;
mod scheduler;
mod stats;

pub use module::PipelineModule;
pub use scheduler::{SchedulerHandle, SchedulerState, TickScheduler};
pub use stats::ModuleStats;
