//! Strand: a serial task-runner scheduling runtime for embedding in host
//! applications.
//!
//! # Overview
//!
//! Clients create named **task runners** — logically serial queues — and
//! submit immediate, delayed, or idle work items. A small pool of
//! **workers** (OS threads, or host run-loops via [`worker::LoopDriver`])
//! multiplexes many runners, rebalances load when the pool is resized,
//! and respects per-runner priorities and accumulated run-time. Each
//! runner also owns keyed runner-local storage that follows it when it
//! migrates between workers.
//!
//! # Core guarantees
//!
//! - **Serial per runner**: at most one task of any runner executes at a
//!   time, process-wide; tasks posted to the same runner run in posting
//!   order.
//! - **Deadlines respected**: a delayed task never runs before its
//!   deadline; ready delayed tasks are promoted ahead of immediate tasks
//!   posted after them.
//! - **Idle work is best-effort**: idle tasks run only when no immediate
//!   or ready-delayed work exists and a positive wait remains; the
//!   remaining budget is passed as a hint.
//! - **Migration is transparent**: rebalancing moves a runner's binding
//!   and its runner-local storage, never its queues.
//!
//! # Module structure
//!
//! - [`time`]: monotonic [`TimePoint`]/[`TimeDelta`] primitives
//! - [`task`]: cancellable [`Task`] and [`IdleTask`] values
//! - [`queue`]: MPMC linked and ring queues
//! - [`runner`]: the [`TaskRunner`] serial queue object
//! - [`worker`]: the worker loop, parking, and run-loop backends
//! - [`manager`]: the [`WorkerManager`] pool owner
//! - [`timer`]: [`OneShotTimer`] and [`RepeatingTimer`]
//! - [`config`]: pool configuration and environment overrides
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use strand::{RunnerOptions, WorkerManager};
//!
//! let manager = WorkerManager::new(2);
//! let runner = manager.create_task_runner(RunnerOptions::new().name("io"));
//! runner.post(|| println!("hello from the runner"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod manager;
pub mod queue;
pub mod runner;
pub mod task;
pub mod test_logging;
pub mod time;
pub mod timer;
pub mod tracing_compat;
pub mod worker;

pub use config::ManagerConfig;
pub use error::{ConfigError, RunnerError};
pub use manager::WorkerManager;
pub use queue::{LinkedQueue, RingQueue};
pub use runner::{RunnerKey, RunnerOptions, TaskRunner, DEFAULT_GROUP_ID};
pub use task::{IdleCallbackParam, IdleTask, Task, TaskHandle};
pub use time::{TimeDelta, TimePoint};
pub use timer::{OneShotTimer, RepeatingTimer};
pub use worker::{LoopDriver, Worker, WORKER_KEYS_MAX};
