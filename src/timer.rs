//! One-shot and repeating timers scheduled through a task runner.
//!
//! A timer posts its fire callback as a delayed task on its runner. A
//! [`reset`](OneShotTimer::reset) that *postpones* the deadline does not
//! post a new task when one is already in flight: the in-flight fire
//! compares the desired run time against the scheduled one and
//! reschedules itself for the difference. [`stop`](OneShotTimer::stop)
//! clears the running flag so any in-flight fire becomes a no-op.
//!
//! The two timer kinds share one core; the variant behaviour at fire
//! time is a sealed enum rather than virtual dispatch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::runner::TaskRunner;
use crate::task::Task;
use crate::time::{TimeDelta, TimePoint};
use crate::tracing_compat::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    OneShot,
    Repeating,
}

struct TimerState {
    kind: TimerKind,
    runner: Mutex<Weak<TaskRunner>>,
    is_running: AtomicBool,
    delay: Mutex<TimeDelta>,
    desired_run_time: Mutex<TimePoint>,
    scheduled_run_time: Mutex<TimePoint>,
    user_task: Mutex<Option<Task>>,
}

impl TimerState {
    fn new(kind: TimerKind, runner: Weak<TaskRunner>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            runner: Mutex::new(runner),
            is_running: AtomicBool::new(false),
            delay: Mutex::new(TimeDelta::ZERO),
            desired_run_time: Mutex::new(TimePoint::ZERO),
            scheduled_run_time: Mutex::new(TimePoint::ZERO),
            user_task: Mutex::new(None),
        })
    }

    fn bind_task_runner(&self, runner: &Arc<TaskRunner>) {
        *self.runner.lock() = Arc::downgrade(runner);
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn start(self: &Arc<Self>, user_task: Task, delay: TimeDelta) {
        *self.user_task.lock() = Some(user_task);
        *self.delay.lock() = delay;
        self.reset();
    }

    fn stop(&self) {
        self.is_running.store(false, Ordering::Release);
        self.user_task.lock().take();
    }

    /// Restarts the delay window from now.
    ///
    /// When a scheduled fire is already in flight and the new desired
    /// run time is not earlier than it, nothing is posted: the in-flight
    /// fire re-checks and reschedules itself.
    fn reset(self: &Arc<Self>) {
        let now = TimePoint::now();
        let delay = *self.delay.lock();
        if *self.scheduled_run_time.lock() < now {
            self.schedule_new_task(delay);
            return;
        }

        let desired = if delay > TimeDelta::ZERO {
            now + delay
        } else {
            now
        };
        *self.desired_run_time.lock() = desired;

        if desired >= *self.scheduled_run_time.lock() {
            self.is_running.store(true, Ordering::Release);
            return;
        }
        self.schedule_new_task(delay);
    }

    fn schedule_new_task(self: &Arc<Self>, delay: TimeDelta) {
        let Some(runner) = self.runner.lock().upgrade() else {
            trace!("timer schedule skipped, runner is gone");
            return;
        };
        self.is_running.store(true, Ordering::Release);

        let weak = Arc::downgrade(self);
        let fire = Task::new(move || {
            if let Some(state) = weak.upgrade() {
                state.on_scheduled_task_invoked();
            }
        });

        let now = TimePoint::now();
        let run_time = if delay > TimeDelta::ZERO {
            runner.post_delayed_task(fire, delay);
            now + delay
        } else {
            runner.post_task(fire);
            now
        };
        *self.scheduled_run_time.lock() = run_time;
        *self.desired_run_time.lock() = run_time;
    }

    fn on_scheduled_task_invoked(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }

        // A later reset postponed us: hand off to a new scheduled task
        // for the remainder instead of firing early.
        let desired = *self.desired_run_time.lock();
        if desired > *self.scheduled_run_time.lock() {
            let now = TimePoint::now();
            if desired > now {
                self.schedule_new_task(desired - now);
                return;
            }
        }

        self.run_user_task();
    }

    fn run_user_task(self: &Arc<Self>) {
        match self.kind {
            TimerKind::OneShot => {
                let task = self.user_task.lock().take();
                self.is_running.store(false, Ordering::Release);
                if let Some(task) = task {
                    task.run();
                }
            }
            TimerKind::Repeating => {
                let delay = *self.delay.lock();
                self.schedule_new_task(delay);
                let task = self.user_task.lock().clone();
                if let Some(task) = task {
                    task.run();
                }
            }
        }
    }
}

/// A timer that fires its task once after a delay.
pub struct OneShotTimer {
    state: Arc<TimerState>,
}

impl OneShotTimer {
    /// Creates a timer scheduling through `runner`.
    #[must_use]
    pub fn new(runner: &Arc<TaskRunner>) -> Self {
        Self {
            state: TimerState::new(TimerKind::OneShot, Arc::downgrade(runner)),
        }
    }

    /// Creates a timer with no runner; bind one with
    /// [`bind_task_runner`](Self::bind_task_runner) before starting.
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            state: TimerState::new(TimerKind::OneShot, Weak::new()),
        }
    }

    /// Binds (or rebinds) the runner used for scheduling.
    pub fn bind_task_runner(&self, runner: &Arc<TaskRunner>) {
        self.state.bind_task_runner(runner);
    }

    /// Arms the timer: `user_task` fires once after `delay`.
    pub fn start(&self, user_task: Task, delay: TimeDelta) {
        self.state.start(user_task, delay);
    }

    /// Runs the user task immediately on the calling thread and stops
    /// the timer. No-op when the timer is not running.
    pub fn fire_now(&self) {
        if self.state.is_running() {
            self.state.run_user_task();
        }
    }

    /// Restarts the delay window from now.
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Disarms the timer; an in-flight fire becomes a no-op.
    pub fn stop(&self) {
        self.state.stop();
    }

    /// True while the timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl std::fmt::Debug for OneShotTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShotTimer")
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// A timer that fires its task repeatedly with a fixed delay.
pub struct RepeatingTimer {
    state: Arc<TimerState>,
}

impl RepeatingTimer {
    /// Creates a timer scheduling through `runner`.
    #[must_use]
    pub fn new(runner: &Arc<TaskRunner>) -> Self {
        Self {
            state: TimerState::new(TimerKind::Repeating, Arc::downgrade(runner)),
        }
    }

    /// Creates a timer with no runner; bind one with
    /// [`bind_task_runner`](Self::bind_task_runner) before starting.
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            state: TimerState::new(TimerKind::Repeating, Weak::new()),
        }
    }

    /// Binds (or rebinds) the runner used for scheduling.
    pub fn bind_task_runner(&self, runner: &Arc<TaskRunner>) {
        self.state.bind_task_runner(runner);
    }

    /// Arms the timer: `user_task` fires every `delay` until
    /// [`stop`](Self::stop). The task must be re-runnable
    /// ([`Task::new`], not [`Task::once`]).
    pub fn start(&self, user_task: Task, delay: TimeDelta) {
        self.state.start(user_task, delay);
    }

    /// Restarts the delay window from now.
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Disarms the timer; an in-flight fire becomes a no-op.
    pub fn stop(&self) {
        self.state.stop();
    }

    /// True while the timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl std::fmt::Debug for RepeatingTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatingTimer")
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}
