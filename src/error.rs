//! Error types for the scheduling runtime.
//!
//! The error surface here is deliberately narrow. Most scheduler
//! operations degrade silently by design: posting to a runner with no
//! bound worker drops the task, posting after termination is a no-op,
//! and runner-local storage operations on unknown keys return sentinels.
//! Programmer errors (storage access outside a task, current-runner
//! lookup with no task running) panic with a diagnostic instead of
//! returning an error. What remains is the small set of fallible
//! operations on the public surface.

use thiserror::Error;

/// Errors returned by fallible [`TaskRunner`](crate::TaskRunner)
/// operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RunnerError {
    /// The runner is not bound to any worker.
    #[error("task runner is not bound to a worker")]
    NoWorkerBound,
    /// The runner has no active sub-runner to remove.
    #[error("task runner has no active sub-runner")]
    NoSubRunner,
}

/// Errors produced while loading [`ManagerConfig`](crate::ManagerConfig)
/// from the environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable was set to an unparseable value.
    #[error("invalid value `{value}` for `{var}`")]
    InvalidEnv {
        /// The environment variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}
