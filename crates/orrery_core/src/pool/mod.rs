//! # Worker Pool
//!
//! Persistent slave threads parked on a [`RendezvousBarrier`](crate::sync::RendezvousBarrier),
//! woken once per dispatch:
//!
//! - [`WorkerPool::execute`]: fork-join over an index range, in blocks.
//! - [`WorkerPool::invoke_on_all`]: one call per thread.
//!
//! The pool never spawns or retires threads after construction.

mod job;
mod worker_pool;

pub use worker_pool::WorkerPool;
