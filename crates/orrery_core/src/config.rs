//! # Pipeline Configuration
//!
//! Thread sizing and runtime settings, loaded once at startup.
//!
//! ```toml
//! max_thread_count = 16
//! thread_oversubscription = -1
//! slave_name_prefix = "sim-slave"
//! slow_iteration_warning_ms = 250
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default upper bound on pool threads.
pub const DEFAULT_MAX_THREAD_COUNT: usize = 64;

/// Default threshold for the slow-iteration warning.
pub const DEFAULT_SLOW_ITERATION_WARNING_MS: u64 = 4000;

/// Runtime configuration for the worker pool and the tick scheduler.
///
/// Missing keys fall back to [`PipelineConfig::default`]; unknown keys are
/// rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Maximum number of pool threads, master included. Must be at least 1.
    pub max_thread_count: usize,
    /// Threads added to the logical core count. Negative values undersubscribe.
    pub thread_oversubscription: i32,
    /// Name prefix for slave threads; the slave index is appended.
    pub slave_name_prefix: String,
    /// Optional stack size for slave threads, in bytes.
    pub slave_stack_size: Option<usize>,
    /// Module iterations slower than this are logged as warnings.
    pub slow_iteration_warning_ms: u64,
    /// Initial value of the pool's single-threaded mode.
    pub force_single_threaded: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_thread_count: DEFAULT_MAX_THREAD_COUNT,
            thread_oversubscription: 0,
            slave_name_prefix: "orrery-slave".to_string(),
            slave_stack_size: None,
            slow_iteration_warning_ms: DEFAULT_SLOW_ITERATION_WARNING_MS,
            force_single_threaded: false,
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// errors of [`PipelineConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_thread_count == 0 {
            return Err(ConfigError::Invalid(
                "max_thread_count must be positive".to_string(),
            ));
        }
        if self.slave_name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "slave_name_prefix must not be empty".to_string(),
            ));
        }
        if self.slave_stack_size == Some(0) {
            return Err(ConfigError::Invalid(
                "slave_stack_size must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Configuration that runs every dispatch on the calling thread only.
    #[must_use]
    pub fn single_threaded() -> Self {
        Self {
            max_thread_count: 1,
            ..Self::default()
        }
    }

    /// Configuration pinned to exactly `threads` pool threads (master included),
    /// regardless of the host's core count.
    #[must_use]
    pub fn with_thread_count(threads: usize) -> Self {
        Self {
            max_thread_count: threads.max(1),
            thread_oversubscription: i32::try_from(threads).unwrap_or(i32::MAX),
            ..Self::default()
        }
    }

    /// Total pool threads, master included.
    ///
    /// Logical cores plus oversubscription, clamped to `[1, max_thread_count]`.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        let cores = i64::try_from(logical_cores()).unwrap_or(i64::MAX);
        let wanted = cores.saturating_add(i64::from(self.thread_oversubscription));
        let wanted = usize::try_from(wanted.max(1)).unwrap_or(usize::MAX);
        wanted.clamp(1, self.max_thread_count.max(1))
    }

    /// Slow-iteration threshold as a [`Duration`].
    #[must_use]
    pub const fn slow_iteration_warning(&self) -> Duration {
        Duration::from_millis(self.slow_iteration_warning_ms)
    }
}

/// Number of logical CPUs on this machine.
#[must_use]
pub fn logical_cores() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.thread_count() >= 1);
        assert!(config.thread_count() <= DEFAULT_MAX_THREAD_COUNT);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            max_thread_count = 3
            slave_name_prefix = "sim"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_thread_count, 3);
        assert_eq!(config.slave_name_prefix, "sim");
        assert_eq!(config.thread_oversubscription, 0);
        assert_eq!(
            config.slow_iteration_warning(),
            Duration::from_millis(DEFAULT_SLOW_ITERATION_WARNING_MS)
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = PipelineConfig::from_toml_str("max_threads = 4");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = PipelineConfig::from_toml_str("max_thread_count = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_thread_count_clamped() {
        assert_eq!(PipelineConfig::single_threaded().thread_count(), 1);
        assert_eq!(PipelineConfig::with_thread_count(4).thread_count(), 4);

        let undersubscribed = PipelineConfig {
            thread_oversubscription: -10_000,
            ..PipelineConfig::default()
        };
        assert_eq!(undersubscribed.thread_count(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let result = PipelineConfig::load("/definitely/not/a/real/orrery.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
