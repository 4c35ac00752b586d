//! In-memory event logging for tests.
//!
//! The end-to-end tests record scheduler-visible events (task execution,
//! migration, timer fires) with timestamps so a failing run can print a
//! readable trace. Verbosity is controlled with the `TEST_LOG_LEVEL`
//! environment variable (`error`, `warn`, `info`, `debug`, `trace`).

use parking_lot::Mutex;
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Instant;

/// Logging verbosity for tests, least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only failures.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Detailed scheduler events.
    Debug,
    /// Everything.
    Trace,
}

impl TestLogLevel {
    /// Reads the level from `TEST_LOG_LEVEL`, defaulting to `Info`.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

impl FromStr for TestLogLevel {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

/// Captures timestamped events for one test run.
#[derive(Debug)]
pub struct TestLogger {
    level: TestLogLevel,
    started_at: Instant,
    entries: Mutex<Vec<(TestLogLevel, f64, String)>>,
}

impl TestLogger {
    /// Creates a logger with the given verbosity.
    #[must_use]
    pub fn new(level: TestLogLevel) -> Self {
        Self {
            level,
            started_at: Instant::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Creates a logger with verbosity from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(TestLogLevel::from_env())
    }

    /// Records an event if `level` is within the configured verbosity.
    pub fn log(&self, level: TestLogLevel, message: impl Into<String>) {
        if level > self.level {
            return;
        }
        let elapsed = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        self.entries.lock().push((level, elapsed, message.into()));
    }

    /// Convenience for `Info` events.
    pub fn info(&self, message: impl Into<String>) {
        self.log(TestLogLevel::Info, message);
    }

    /// Number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no events were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Renders the captured events as a readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let entries = self.entries.lock();
        let mut out = String::new();
        for (level, elapsed_ms, message) in entries.iter() {
            let _ = writeln!(out, "[{elapsed_ms:9.3}ms] {level:?}: {message}");
        }
        out
    }
}
