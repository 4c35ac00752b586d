//! Cancellable units of work.
//!
//! A [`Task`] is a cheap clonable handle over a thunk plus an atomic
//! cancel flag. Producers keep a clone to call [`Task::cancel`] from any
//! thread; the worker that pops the task calls [`Task::run`], which
//! invokes the thunk only if the task was not cancelled first.
//! Cancelling a task that is already running has no effect.
//!
//! [`IdleTask`] is the variant handed to idle-queue consumers: its thunk
//! receives an [`IdleCallbackParam`] describing the remaining slack
//! before the next deadline.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use crate::time::TimeDelta;

type Callback = Box<dyn FnMut() + Send>;
type IdleCallback = Box<dyn FnMut(IdleCallbackParam) + Send>;

/// A cancellable unit of work.
#[derive(Clone, Default)]
pub struct Task {
    inner: Arc<TaskInner>,
}

#[derive(Default)]
struct TaskInner {
    is_cancelled: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl Task {
    /// Creates a task from a re-runnable closure.
    ///
    /// Re-runnability only matters to holders that invoke the same task
    /// repeatedly (the repeating timer does); a queued task is run once.
    #[must_use]
    pub fn new(callback: impl FnMut() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                is_cancelled: AtomicBool::new(false),
                callback: Mutex::new(Some(Box::new(callback))),
            }),
        }
    }

    /// Creates a task from a one-shot closure.
    ///
    /// Running the task more than once is a no-op after the first run.
    #[must_use]
    pub fn once(callback: impl FnOnce() + Send + 'static) -> Self {
        let mut slot = Some(callback);
        Self::new(move || {
            if let Some(callback) = slot.take() {
                callback();
            }
        })
    }

    /// Runs the task thunk unless the task has been cancelled.
    ///
    /// Running a cancelled task releases its thunk (and everything the
    /// thunk captured) without invoking it.
    pub fn run(&self) {
        if self.inner.is_cancelled.load(Ordering::Acquire) {
            self.inner.callback.lock().take();
            return;
        }
        let mut guard = self.inner.callback.lock();
        if let Some(callback) = guard.as_mut() {
            callback();
        }
    }

    /// Marks the task as cancelled.
    ///
    /// Idempotent and callable from any thread. Has no effect on a task
    /// whose thunk has already started executing.
    pub fn cancel(&self) {
        self.inner.is_cancelled.store(true, Ordering::Release);
    }

    /// Returns true if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("is_cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The slack information passed to an idle task when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleCallbackParam {
    /// True when the scheduler ran the idle task because its deadline
    /// hint expired rather than because slack was available.
    pub did_time_out: bool,
    /// The remaining time budget before the next scheduled deadline.
    /// A hint only; idle tasks are never interrupted.
    pub res_time: TimeDelta,
}

/// A cancellable unit of idle work.
///
/// Idle tasks run only when a worker has no immediate or ready-delayed
/// task and a positive wait remains before the next deadline.
#[derive(Clone)]
pub struct IdleTask {
    is_cancelled: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<IdleCallback>>>,
}

impl IdleTask {
    /// Creates an idle task from a closure receiving the slack budget.
    #[must_use]
    pub fn new(callback: impl FnMut(IdleCallbackParam) + Send + 'static) -> Self {
        Self {
            is_cancelled: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Creates an idle task from a one-shot closure.
    #[must_use]
    pub fn once(callback: impl FnOnce(IdleCallbackParam) + Send + 'static) -> Self {
        let mut slot = Some(callback);
        Self::new(move |param| {
            if let Some(callback) = slot.take() {
                callback(param);
            }
        })
    }

    /// Runs the idle thunk with the given slack unless cancelled.
    ///
    /// Running a cancelled idle task releases its thunk without
    /// invoking it.
    pub fn run(&self, param: IdleCallbackParam) {
        if self.is_cancelled.load(Ordering::Acquire) {
            self.callback.lock().take();
            return;
        }
        let mut guard = self.callback.lock();
        if let Some(callback) = guard.as_mut() {
            callback(param);
        }
    }

    /// Marks the idle task as cancelled.
    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Release);
    }

    /// Returns true if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for IdleTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTask")
            .field("is_cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A handle to a posted task that produces a value.
///
/// Returned by
/// [`TaskRunner::post_with_result`](crate::TaskRunner::post_with_result).
/// [`join`](Self::join) blocks until the task has run (or was dropped
/// without running, e.g. cancelled or discarded with its queue).
#[derive(Debug)]
pub struct TaskHandle<R> {
    task: Task,
    receiver: mpsc::Receiver<R>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(task: Task, receiver: mpsc::Receiver<R>) -> Self {
        Self { task, receiver }
    }

    /// The underlying task, e.g. for cancellation.
    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Blocks until the task produces its value.
    ///
    /// Returns `None` if the task was cancelled or dropped unrun.
    #[must_use]
    pub fn join(self) -> Option<R> {
        let Self { task, receiver } = self;
        // Release our own reference to the thunk so an unrun task does
        // not keep the result channel open against ourselves.
        drop(task);
        receiver.recv().ok()
    }
}
