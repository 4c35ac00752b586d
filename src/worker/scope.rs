//! Thread-local bookkeeping for the task currently executing.
//!
//! A [`TaskScope`] is entered by the worker immediately before running a
//! task and restored on drop, including during unwinding, so a panicking
//! task cannot poison the current-runner accessor. Scopes nest: the
//! stacking pump entered by
//! [`add_sub_task_runner`](crate::TaskRunner::add_sub_task_runner) runs
//! inner tasks whose scopes shadow and then restore the outer one.

use std::cell::RefCell;
use std::sync::Arc;

use super::RunnerGroup;
use crate::runner::TaskRunner;

struct CurrentTask {
    runner: Arc<TaskRunner>,
    #[allow(dead_code)]
    group: RunnerGroup,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<CurrentTask>> = const { RefCell::new(None) };
}

/// Guard publishing the executing task's runner for the current thread.
pub(crate) struct TaskScope {
    previous: Option<CurrentTask>,
}

impl TaskScope {
    pub(crate) fn enter(runner: Arc<TaskRunner>, group: RunnerGroup) -> Self {
        let previous = CURRENT_TASK
            .with(|cell| cell.borrow_mut().replace(CurrentTask { runner, group }));
        Self { previous }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| {
            *cell.borrow_mut() = self.previous.take();
        });
    }
}

/// The runner whose task is executing on this thread, if any.
pub(crate) fn current_task_runner() -> Option<Arc<TaskRunner>> {
    CURRENT_TASK.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|current| Arc::clone(&current.runner))
    })
}

/// True while a task is executing on this thread.
pub(crate) fn is_task_running() -> bool {
    CURRENT_TASK.with(|cell| cell.borrow().is_some())
}
