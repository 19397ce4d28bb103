//! # Synchronization Primitives for the Pipeline
//!
//! ## The Problem
//!
//! ```text
//! Master thread:   owns the tick loop, dispatches parallel work
//! Slave threads:   park between dispatches, wake together, finish together
//! Any thread:      needs the master to do something "right now"
//!
//! Naive barrier:         master blocks on slaves, slave blocks on master → DEADLOCK
//! Naive lock on state:   freeze can't tell when mutators are done       → TORN STATE
//! ```
//!
//! ## The Solution
//!
//! - [`RendezvousBarrier`]: two-phase master/slave rendezvous. Every master
//!   wait also drains the [`MasterInvocation`] queue, so a slave that blocks
//!   on master work mid-dispatch never stalls the round.
//! - [`MutationGuard`]: many concurrent [`MutationPermit`]s, one global
//!   freeze that drains them.

mod barrier;
mod invocation;
mod mutation;

pub use barrier::RendezvousBarrier;
pub use invocation::{MasterInvocation, PanicPayload};
pub use mutation::{LockedPermit, MutationGuard, MutationPermit};
