//! Contract between the tick scheduler and the simulation modules it drives.

use std::time::Duration;

use crate::error::ModuleError;
use crate::pool::WorkerPool;

/// A unit of simulation work iterated at its own cadence on the master thread.
///
/// ```rust,ignore
/// struct Physics { bodies: Vec<Body> }
///
/// impl PipelineModule for Physics {
///     fn tick_interval(&self) -> Duration {
///         Duration::from_millis(10)
///     }
///
///     fn pipeline_iterate(&mut self, pool: &WorkerPool, delta: Duration) -> Result<(), ModuleError> {
///         let bodies = &self.bodies;
///         pool.execute(bodies.len(), 256, |i| bodies[i].integrate(delta))?;
///         Ok(())
///     }
/// }
/// ```
pub trait PipelineModule: Send {
    /// Time between two iterations of this module. Read once, at registration.
    fn tick_interval(&self) -> Duration;

    /// Called once when the module is registered with a scheduler.
    fn module_added(&mut self) {}

    /// Name used in logs, errors and statistics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs one iteration.
    ///
    /// `delta` is the wall-clock time since the previous iteration of this
    /// module (or since the scheduler started, for the first one).
    ///
    /// # Errors
    ///
    /// Any error stops the scheduler and is returned from
    /// [`TickScheduler::start`](crate::TickScheduler::start).
    fn pipeline_iterate(&mut self, pool: &WorkerPool, delta: Duration) -> Result<(), ModuleError>;
}
