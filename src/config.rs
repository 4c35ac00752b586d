//! Worker pool configuration.
//!
//! Settings resolve in this order (highest priority first):
//!
//! 1. **Programmatic** — builder methods on [`ManagerConfig`]
//! 2. **Environment** — `STRAND_*` variables via
//!    [`ManagerConfig::from_env`]
//! 3. **Defaults** — machine parallelism, `strand-worker` thread names,
//!    exit-immediately termination
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `STRAND_WORKER_THREADS` | `usize` | pool size |
//! | `STRAND_THREAD_NAME_PREFIX` | `String` | worker thread names |
//! | `STRAND_EXIT_IMMEDIATELY` | `bool` | termination draining |

use std::env;
use std::thread;

use crate::error::ConfigError;

/// Environment variable for the worker pool size.
pub const ENV_WORKER_THREADS: &str = "STRAND_WORKER_THREADS";
/// Environment variable for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "STRAND_THREAD_NAME_PREFIX";
/// Environment variable for termination draining behaviour.
pub const ENV_EXIT_IMMEDIATELY: &str = "STRAND_EXIT_IMMEDIATELY";

const DEFAULT_THREAD_NAME_PREFIX: &str = "strand-worker";

/// Configuration for a [`WorkerManager`](crate::WorkerManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    worker_threads: Option<usize>,
    thread_name_prefix: String,
    is_exit_immediately: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            is_exit_immediately: true,
        }
    }
}

impl ManagerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the default configuration with environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = env::var(ENV_WORKER_THREADS) {
            let threads = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_WORKER_THREADS,
                value: value.clone(),
            })?;
            config.worker_threads = Some(threads);
        }
        if let Ok(value) = env::var(ENV_THREAD_NAME_PREFIX) {
            config.thread_name_prefix = value;
        }
        if let Ok(value) = env::var(ENV_EXIT_IMMEDIATELY) {
            config.is_exit_immediately = match value.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_EXIT_IMMEDIATELY,
                        value,
                    })
                }
            };
        }
        Ok(config)
    }

    /// Sets the worker pool size (clamped to at least one at creation).
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Controls whether terminating workers drop queued immediate tasks
    /// (true, the default) or drain them first (false).
    #[must_use]
    pub fn exit_immediately(mut self, is_exit_immediately: bool) -> Self {
        self.is_exit_immediately = is_exit_immediately;
        self
    }

    /// The configured pool size, or machine parallelism when unset.
    /// Never zero.
    #[must_use]
    pub fn worker_threads_or_default(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| {
                thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
            })
            .max(1)
    }

    /// The worker thread name prefix.
    #[must_use]
    pub fn name_prefix(&self) -> &str {
        &self.thread_name_prefix
    }

    /// Whether terminating workers skip queued immediate tasks.
    #[must_use]
    pub fn is_exit_immediately(&self) -> bool {
        self.is_exit_immediately
    }
}
