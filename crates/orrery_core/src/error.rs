//! # Pipeline Error Types
//!
//! Recoverable failures of the concurrency core.
//!
//! Programmer errors (wrong-thread calls, reentrant dispatch, double permit
//! disposal) are not represented here: they fail fast with a panic.

use thiserror::Error;

/// Boxed error returned by a [`PipelineModule`](crate::PipelineModule) iteration.
pub type ModuleError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the synchronization primitives.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// A blocking wait was interrupted because the guard is shutting down.
    #[error("wait interrupted: mutation guard is shutting down")]
    Interrupted,

    /// Work was queued on a barrier that has already been disposed.
    #[error("barrier has been disposed")]
    Disposed,
}

/// Errors raised by the worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool was disposed before or during the dispatch.
    #[error("worker pool has been disposed")]
    Disposed,

    /// A slave thread could not be created.
    #[error("failed to spawn slave thread {index}: {source}")]
    Spawn {
        /// Index of the slave that failed to start.
        index: usize,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the tick scheduler.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// `start` or `add_module` was called on a scheduler that already left
    /// `NotStarted`.
    #[error("pipeline is already running or has stopped")]
    AlreadyStarted,

    /// `start` was called without any registered module.
    #[error("at least one module is required to run the pipeline")]
    NoModules,

    /// A module with the same name is already registered.
    #[error("module '{0}' is already added")]
    DuplicateModule(String),

    /// A master invocation was requested while the pipeline is not running.
    #[error("pipeline is not running")]
    NotRunning,

    /// The pipeline was disposed before the request could complete.
    #[error("pipeline has been disposed")]
    Disposed,

    /// The worker pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A module iteration returned an error, terminating the loop.
    #[error("module '{name}' failed: {source}")]
    Module {
        /// Name of the failing module.
        name: String,
        /// Error returned by the module.
        #[source]
        source: ModuleError,
    },
}

/// Errors raised while loading a [`PipelineConfig`](crate::PipelineConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for worker pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type for scheduler operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
