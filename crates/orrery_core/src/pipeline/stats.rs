//! Per-module timing statistics.

use std::time::Duration;

/// Timing record for one registered module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleStats {
    name: String,
    interval: Duration,
    invocations: u64,
    last_delta: Duration,
    last_iteration: Duration,
    max_iteration: Duration,
    total_iteration: Duration,
    slow_iterations: u64,
}

impl ModuleStats {
    pub(crate) fn new(name: String, interval: Duration) -> Self {
        Self {
            name,
            interval,
            invocations: 0,
            last_delta: Duration::ZERO,
            last_iteration: Duration::ZERO,
            max_iteration: Duration::ZERO,
            total_iteration: Duration::ZERO,
            slow_iterations: 0,
        }
    }

    /// Records one iteration. Returns `true` if it exceeded `slow_threshold`.
    pub(crate) fn record(
        &mut self,
        delta: Duration,
        iteration: Duration,
        slow_threshold: Duration,
    ) -> bool {
        self.invocations += 1;
        self.last_delta = delta;
        self.last_iteration = iteration;
        self.max_iteration = self.max_iteration.max(iteration);
        self.total_iteration = self.total_iteration.saturating_add(iteration);

        let slow = iteration > slow_threshold;
        if slow {
            self.slow_iterations += 1;
        }
        slow
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured tick interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed iterations.
    #[must_use]
    pub const fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Delta passed to the most recent iteration.
    #[must_use]
    pub const fn last_delta(&self) -> Duration {
        self.last_delta
    }

    /// Wall-clock cost of the most recent iteration.
    #[must_use]
    pub const fn last_iteration(&self) -> Duration {
        self.last_iteration
    }

    /// Slowest iteration observed.
    #[must_use]
    pub const fn max_iteration(&self) -> Duration {
        self.max_iteration
    }

    /// Mean iteration cost, zero before the first iteration.
    #[must_use]
    pub fn avg_iteration(&self) -> Duration {
        match u32::try_from(self.invocations) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total_iteration / count,
            Err(_) => {
                let nanos = self.total_iteration.as_nanos() / u128::from(self.invocations);
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
        }
    }

    /// Iterations slower than the configured warning threshold.
    #[must_use]
    pub const fn slow_iterations(&self) -> u64 {
        self.slow_iterations
    }
}
