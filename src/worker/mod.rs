//! Workers: the execution vehicles for task runners.
//!
//! A [`Worker`] binds an OS thread (or a host run-loop via
//! [`LoopDriver`]) to an ordered set of **runner groups**. Its loop
//! repeatedly selects the next ready task across all running groups,
//! executes it, and charges the elapsed wall-time to every runner in the
//! group that produced it. Between tasks the loop sorts groups by
//! `priority * accumulated_time`, folds freshly bound groups in
//! (balancing), and sleeps until the earliest delayed-task deadline or
//! the next notification.
//!
//! Only the **back** runner of a group is eligible to run, which is what
//! makes the nested sub-runner pump work: pushing a child runner onto a
//! group blocks the runners beneath it until the child is removed.
//!
//! Workers also own the runner-local storage for every runner bound to
//! them; the manager moves that storage along when it migrates a runner
//! to another worker.

mod parker;
mod scope;

pub use parker::Parker;
pub(crate) use scope::{current_task_runner, TaskScope};

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crate::queue::LinkedQueue;
use crate::runner::{RunnerKey, TaskRunner, DEFAULT_GROUP_ID};
use crate::task::{IdleCallbackParam, IdleTask, Task};
use crate::time::{TimeDelta, TimePoint};
use crate::tracing_compat::{debug, trace, warn};

/// Number of runner-local storage slots per runner.
pub const WORKER_KEYS_MAX: usize = 32;

/// A value held in runner-local storage.
pub type SpecificValue = Arc<dyn Any + Send + Sync>;

/// A destructor invoked when a storage slot is destroyed while still
/// holding a value.
pub type SpecificDestructor = Arc<dyn Fn(SpecificValue) + Send + Sync>;

/// An ordered set of runners sharing one worker. The front runner is the
/// primary; the back is the current top-of-stack sub-runner.
pub(crate) type RunnerGroup = SmallVec<[Arc<TaskRunner>; 2]>;

static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(0);

/// True while a task is executing on the calling thread.
#[must_use]
pub fn is_task_running() -> bool {
    scope::is_task_running()
}

/// Backend contract for workers driven by an external event loop.
///
/// The host owns the loop; the scheduler only ever asks it to call
/// [`Worker::poll`] again later. `Notify` becomes
/// `schedule_wake(TimeDelta::ZERO)`.
pub trait LoopDriver: Send + Sync {
    /// Asks the host loop to call [`Worker::poll`] after `delay`.
    ///
    /// [`TimeDelta::ZERO`] (or negative) means as soon as possible;
    /// [`TimeDelta::MAX`] means only when next asked.
    fn schedule_wake(&self, delay: TimeDelta);
}

enum Backend {
    Thread(Parker),
    Loop(Arc<dyn LoopDriver>),
}

#[derive(Clone, Default)]
struct KeySlot {
    is_used: bool,
    destructor: Option<SpecificDestructor>,
}

/// Runner-local storage for one runner bound to this worker: a keys
/// array and a values array, moved wholesale on migration.
pub(crate) struct RunnerSlots {
    keys: [KeySlot; WORKER_KEYS_MAX],
    values: [Option<SpecificValue>; WORKER_KEYS_MAX],
}

impl Default for RunnerSlots {
    fn default() -> Self {
        Self {
            keys: std::array::from_fn(|_| KeySlot::default()),
            values: std::array::from_fn(|_| None),
        }
    }
}

struct Dispatch {
    task: Task,
    /// Runner and group to publish and charge; `None` for injected
    /// tasks, which run without a runner context.
    context: Option<(Arc<TaskRunner>, RunnerGroup)>,
}

enum Fetch {
    Task(Dispatch),
    Wait(TimeDelta),
    Terminated,
}

/// The execution vehicle for task runners: a thread or host run-loop
/// with its own scheduling loop.
pub struct Worker {
    id: u32,
    name: String,
    is_schedulable: bool,
    group_id: AtomicU32,
    is_terminated: AtomicBool,
    is_exit_immediately: AtomicBool,
    need_balance: AtomicBool,
    is_stacking_mode: AtomicBool,
    // Lock order: `running_groups` before `pending_groups`.
    running_groups: Mutex<Vec<RunnerGroup>>,
    pending_groups: Mutex<Vec<RunnerGroup>>,
    specifics: Mutex<HashMap<u32, RunnerSlots>>,
    /// Cross-worker injected tasks; checked before any runner queue.
    injected: LinkedQueue<Task>,
    /// Expected instant of the next delayed task, for idle budgeting.
    next_task_time_nanos: AtomicU64,
    backend: Backend,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(name: String, is_schedulable: bool, backend: Backend) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            is_schedulable,
            group_id: AtomicU32::new(DEFAULT_GROUP_ID),
            is_terminated: AtomicBool::new(false),
            is_exit_immediately: AtomicBool::new(true),
            need_balance: AtomicBool::new(false),
            is_stacking_mode: AtomicBool::new(false),
            running_groups: Mutex::new(Vec::new()),
            pending_groups: Mutex::new(Vec::new()),
            specifics: Mutex::new(HashMap::new()),
            injected: LinkedQueue::new(),
            next_task_time_nanos: AtomicU64::new(u64::MAX),
            backend,
            join_handle: Mutex::new(None),
        }
    }

    /// Spawns a thread-backed worker and starts its loop.
    ///
    /// Thread creation can fail under resource exhaustion; the caller
    /// decides how to degrade (the manager keeps the pool smaller).
    pub(crate) fn spawn(
        name: String,
        is_schedulable: bool,
        is_exit_immediately: bool,
    ) -> std::io::Result<Arc<Self>> {
        let worker = Arc::new(Self::new(name, is_schedulable, Backend::Thread(Parker::new())));
        worker
            .is_exit_immediately
            .store(is_exit_immediately, Ordering::Relaxed);
        let thread_name = if worker.name.is_empty() {
            format!("strand-worker-{}", worker.id)
        } else {
            worker.name.clone()
        };
        let loop_worker = Arc::clone(&worker);
        match thread::Builder::new()
            .name(thread_name)
            .spawn(move || loop_worker.run_loop())
        {
            Ok(handle) => {
                *worker.join_handle.lock() = Some(handle);
                Ok(worker)
            }
            Err(error) => {
                // Never ran; mark terminated so teardown stays quiet.
                worker.is_terminated.store(true, Ordering::Release);
                Err(error)
            }
        }
    }

    /// Creates a worker driven by an external run-loop.
    ///
    /// The host must call [`poll`](Self::poll) whenever the driver's
    /// scheduled wake fires; the worker never blocks. Loop workers also
    /// run the host's own work, whose time the scheduler cannot
    /// account, so they are unschedulable: runners can be created on
    /// them but are never migrated onto them.
    #[must_use]
    pub fn with_loop_driver(name: impl Into<String>, driver: Arc<dyn LoopDriver>) -> Arc<Self> {
        Arc::new(Self::new(name.into(), false, Backend::Loop(driver)))
    }

    /// The process-unique worker id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The worker's label (also its thread name, when non-empty).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False when this worker must not receive migrated runners.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.is_schedulable
    }

    /// The co-location group id carried by this worker's runners
    /// (0 when unconstrained).
    #[must_use]
    pub fn group_id(&self) -> u32 {
        self.group_id.load(Ordering::Relaxed)
    }

    /// True once [`terminate`](Self::terminate) has been called.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.is_terminated.load(Ordering::Acquire)
    }

    /// Controls termination draining: when false, the loop finishes the
    /// immediate queues (not delayed or idle) before exiting.
    pub fn set_exit_immediately(&self, is_exit_immediately: bool) {
        self.is_exit_immediately
            .store(is_exit_immediately, Ordering::Relaxed);
    }

    fn is_exit_immediately(&self) -> bool {
        self.is_exit_immediately.load(Ordering::Relaxed)
    }

    /// True while a nested sub-runner pump is active on this worker.
    #[must_use]
    pub fn is_stacking_mode(&self) -> bool {
        self.is_stacking_mode.load(Ordering::Relaxed)
    }

    pub(crate) fn set_stacking_mode(&self, is_stacking_mode: bool) {
        self.is_stacking_mode
            .store(is_stacking_mode, Ordering::Relaxed);
    }

    /// Number of groups currently in the running set.
    #[must_use]
    pub fn running_group_len(&self) -> usize {
        self.running_groups.lock().len()
    }

    /// Time remaining until the earliest known delayed-task deadline.
    ///
    /// Negative once the deadline has passed; based on the last
    /// scheduling pass, so a hint only.
    #[must_use]
    pub fn time_remaining(&self) -> TimeDelta {
        TimePoint::from_nanos(self.next_task_time_nanos.load(Ordering::Relaxed)) - TimePoint::now()
    }

    /// Wakes the worker from its timed wait.
    pub fn notify(&self) {
        match &self.backend {
            Backend::Thread(parker) => parker.unpark(),
            Backend::Loop(driver) => driver.schedule_wake(TimeDelta::ZERO),
        }
    }

    /// Injects a task to run on this specific worker, ahead of any
    /// runner queue and outside any runner context.
    pub fn post_immediate_task(&self, task: Task) {
        self.injected.push(task);
        self.notify();
    }

    /// Signals termination and joins the worker thread (when called from
    /// another thread). Idempotent.
    pub fn terminate(&self) {
        if !self.is_terminated.swap(true, Ordering::AcqRel) {
            debug!(worker_id = self.id, "worker terminating");
            self.notify();
        }
        self.join();
    }

    fn join(&self) {
        let handle = self.join_handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Terminating from our own loop; the loop exits on its own.
                return;
            }
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Scheduling loop
    // ------------------------------------------------------------------

    fn run_loop(&self) {
        debug!(worker_id = self.id, name = %self.name, "worker loop started");
        loop {
            match self.fetch() {
                Fetch::Task(dispatch) => self.execute(dispatch),
                Fetch::Wait(delta) => self.wait_for(delta),
                Fetch::Terminated => {
                    if !self.is_exit_immediately() {
                        self.drain_immediate();
                    }
                    break;
                }
            }
        }
        debug!(worker_id = self.id, "worker loop exited");
    }

    /// Runs at most one scheduling step: execute a task, or wait for the
    /// next deadline/notification. Returns false once terminated.
    ///
    /// This is the pump used by the nested sub-runner mode.
    pub(crate) fn run_task(&self) -> bool {
        match self.fetch() {
            Fetch::Task(dispatch) => {
                self.execute(dispatch);
                true
            }
            Fetch::Wait(delta) => {
                self.wait_for(delta);
                true
            }
            Fetch::Terminated => false,
        }
    }

    /// Host-loop entry point: runs every ready task, then schedules the
    /// next wake on the [`LoopDriver`] and returns.
    pub fn poll(&self) {
        loop {
            match self.fetch() {
                Fetch::Task(dispatch) => self.execute(dispatch),
                Fetch::Wait(delta) => {
                    self.wait_for(delta);
                    return;
                }
                Fetch::Terminated => {
                    if !self.is_exit_immediately() {
                        self.drain_immediate();
                    }
                    return;
                }
            }
        }
    }

    fn fetch(&self) -> Fetch {
        // Termination is an exit flag: queued work is not run through the
        // normal path. The loop decides whether to drain immediates.
        if self.is_terminated() {
            return Fetch::Terminated;
        }

        // 1. Cross-worker injected tasks run first, with no runner context.
        if let Some(task) = self.injected.pop() {
            return Fetch::Task(Dispatch {
                task,
                context: None,
            });
        }

        // 2. Keep the highest-priority group (smallest priority * time)
        // at the front.
        {
            let mut running = self.running_groups.lock();
            if running.len() > 1 {
                Self::sort_groups(&mut running);
            }
        }

        // 3. Fold freshly bound groups into the running set.
        if self.need_balance.load(Ordering::Acquire) {
            let mut running = self.running_groups.lock();
            let mut pending = self.pending_groups.lock();
            Self::balance(&mut running, &mut pending);
            self.need_balance.store(false, Ordering::Release);
        }

        // 4. Scan groups in priority order. Only the top-of-stack runner
        // of each group is eligible, preserving sub-runner stacking.
        let now = TimePoint::now();
        let mut min_wait = TimeDelta::MAX;
        {
            let running = self.running_groups.lock();
            for group in running.iter() {
                debug_assert!(!group.is_empty(), "bound groups are never empty");
                let Some(top) = group.last() else { continue };
                if let Some(task) = top.get_next() {
                    return Fetch::Task(Dispatch {
                        task,
                        context: Some((Arc::clone(top), group.clone())),
                    });
                }
                let wait = group[0].next_time_delta(now);
                if wait < min_wait {
                    min_wait = wait;
                }
            }

            self.next_task_time_nanos
                .store((now + min_wait).as_nanos(), Ordering::Relaxed);

            // 5. No ready task anywhere: spend the slack on idle work.
            for group in running.iter() {
                if let Some(idle_task) = group[0].pop_idle_task() {
                    let front = Arc::clone(&group[0]);
                    let group = group.clone();
                    return Fetch::Task(Dispatch {
                        task: Self::wrap_idle_task(idle_task, min_wait),
                        context: Some((front, group)),
                    });
                }
            }
        }

        // 6. Nothing to do until the earliest deadline or a notification.
        Fetch::Wait(min_wait)
    }

    fn wrap_idle_task(idle_task: IdleTask, budget: TimeDelta) -> Task {
        Task::once(move || {
            idle_task.run(IdleCallbackParam {
                did_time_out: false,
                res_time: budget,
            });
        })
    }

    fn execute(&self, dispatch: Dispatch) {
        match dispatch.context {
            Some((runner, group)) => {
                trace!(worker_id = self.id, runner_id = runner.id(), "task starting");
                let begin = TimePoint::now();
                {
                    let _scope = TaskScope::enter(runner, group.clone());
                    dispatch.task.run();
                }
                let elapsed = TimePoint::now() - begin;
                // Charge the elapsed wall-time to every runner of the
                // group, under the running-group lock.
                let _running = self.running_groups.lock();
                for member in &group {
                    member.add_time(elapsed);
                }
            }
            None => dispatch.task.run(),
        }
    }

    fn wait_for(&self, delta: TimeDelta) {
        match &self.backend {
            Backend::Thread(parker) => {
                if delta.is_max() {
                    parker.park();
                } else if let Some(duration) = delta.to_duration() {
                    parker.park_timeout(duration);
                }
                // Negative delta: a deadline is already due, return to
                // the loop without sleeping.
            }
            Backend::Loop(driver) => driver.schedule_wake(delta),
        }
    }

    fn drain_immediate(&self) {
        while let Some(task) = self.injected.pop() {
            task.run();
        }
        let groups: Vec<RunnerGroup> = self.running_groups.lock().clone();
        for group in groups {
            for runner in &group {
                while let Some(task) = runner.pop_task() {
                    let _scope = TaskScope::enter(Arc::clone(runner), group.clone());
                    task.run();
                }
            }
        }
    }

    fn sort_groups(groups: &mut [RunnerGroup]) {
        groups.sort_by_key(|group| {
            debug_assert!(!group.is_empty());
            let front = &group[0];
            i64::from(front.priority()).saturating_mul(front.time().as_nanos())
        });
    }

    /// Moves every pending group to the front of the running set, after
    /// initialising each new runner's time to the current front group's
    /// time so the entrants compete from the same baseline.
    fn balance(running: &mut Vec<RunnerGroup>, pending: &mut Vec<RunnerGroup>) {
        if pending.is_empty() {
            return;
        }
        let base_time = running
            .first()
            .map_or(TimeDelta::ZERO, |group| group[0].time());
        for group in pending.iter() {
            for runner in group {
                runner.set_time(base_time);
            }
        }
        trace!(count = pending.len(), "balancing pending groups");
        running.splice(0..0, pending.drain(..));
    }

    // ------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------

    /// Binds a whole group to this worker via the pending set.
    pub(crate) fn bind(self: &Arc<Self>, group: RunnerGroup) {
        debug_assert!(!group.is_empty());
        for runner in &group {
            runner.bind_worker(self);
        }
        self.ensure_slots(&group);
        {
            let mut pending = self.pending_groups.lock();
            let group_id = group[0].group_id();
            if group_id != DEFAULT_GROUP_ID {
                self.group_id.store(group_id, Ordering::Relaxed);
            }
            pending.push(group);
        }
        self.need_balance.store(true, Ordering::Release);
        self.notify();
    }

    /// Appends `child` to the back of the group containing `parent_id`,
    /// making it that group's new top-of-stack.
    pub(crate) fn bind_group(self: &Arc<Self>, parent_id: u32, child: Arc<TaskRunner>) {
        child.bind_worker(self);
        self.specifics.lock().entry(child.id()).or_default();
        {
            let mut running = self.running_groups.lock();
            if let Some(group) = running
                .iter_mut()
                .find(|group| group.iter().any(|runner| runner.id() == parent_id))
            {
                group.push(child);
                return;
            }
        }
        {
            let mut pending = self.pending_groups.lock();
            if let Some(group) = pending
                .iter_mut()
                .find(|group| group.iter().any(|runner| runner.id() == parent_id))
            {
                group.push(child);
                return;
            }
        }
        warn!(parent_id, "bind_group: parent runner is not bound to this worker");
        debug_assert!(false, "bind_group parent not found");
    }

    /// Removes one runner from whichever group holds it. Empty groups
    /// are dropped.
    pub(crate) fn unbind_runner(&self, runner: &TaskRunner) {
        let target = runner.id();
        {
            let mut running = self.running_groups.lock();
            if Self::remove_from_groups(&mut running, target) {
                return;
            }
        }
        let mut pending = self.pending_groups.lock();
        let _ = Self::remove_from_groups(&mut pending, target);
    }

    fn remove_from_groups(groups: &mut Vec<RunnerGroup>, target: u32) -> bool {
        for group in groups.iter_mut() {
            if let Some(position) = group.iter().position(|runner| runner.id() == target) {
                group.remove(position);
                groups.retain(|group| !group.is_empty());
                return true;
            }
        }
        false
    }

    /// Removes and returns every group (running then pending).
    pub(crate) fn unbind_all(&self) -> Vec<RunnerGroup> {
        let mut groups: Vec<RunnerGroup> = {
            let mut running = self.running_groups.lock();
            running.drain(..).collect()
        };
        groups.extend(self.pending_groups.lock().drain(..));
        groups
    }

    /// Removes and returns every pending group.
    pub(crate) fn release_pending(&self) -> Vec<RunnerGroup> {
        self.pending_groups.lock().drain(..).collect()
    }

    /// Removes and returns the groups eligible for migration: every
    /// group except the current front group and groups containing an
    /// unschedulable runner, plus migratable pending groups.
    pub(crate) fn retain_active_and_unschedulable(&self) -> Vec<RunnerGroup> {
        let mut moved = Vec::new();
        {
            let mut running = self.running_groups.lock();
            let groups: Vec<RunnerGroup> = running.drain(..).collect();
            for (index, group) in groups.into_iter().enumerate() {
                let pinned =
                    index == 0 || group.iter().any(|runner| !runner.is_schedulable());
                if pinned {
                    running.push(group);
                } else {
                    moved.push(group);
                }
            }
        }
        {
            let mut pending = self.pending_groups.lock();
            let groups: Vec<RunnerGroup> = pending.drain(..).collect();
            for group in groups {
                if group.iter().any(|runner| !runner.is_schedulable()) {
                    pending.push(group);
                } else {
                    moved.push(group);
                }
            }
        }
        moved
    }

    // ------------------------------------------------------------------
    // Runner-local storage
    // ------------------------------------------------------------------

    fn ensure_slots(&self, group: &RunnerGroup) {
        let mut specifics = self.specifics.lock();
        for runner in group {
            specifics.entry(runner.id()).or_default();
        }
    }

    pub(crate) fn worker_key_create(
        &self,
        runner_id: u32,
        destructor: Option<SpecificDestructor>,
    ) -> Option<RunnerKey> {
        let mut specifics = self.specifics.lock();
        let slots = specifics.get_mut(&runner_id)?;
        let index = slots.keys.iter().position(|slot| !slot.is_used)?;
        slots.keys[index] = KeySlot {
            is_used: true,
            destructor,
        };
        slots.values[index] = None;
        Some(RunnerKey(index as u32))
    }

    pub(crate) fn worker_key_delete(&self, runner_id: u32, key: RunnerKey) -> bool {
        let mut specifics = self.specifics.lock();
        let Some(slots) = specifics.get_mut(&runner_id) else {
            return false;
        };
        let index = key.index() as usize;
        if index >= WORKER_KEYS_MAX || !slots.keys[index].is_used {
            return false;
        }
        slots.keys[index] = KeySlot::default();
        slots.values[index] = None;
        true
    }

    pub(crate) fn worker_set_specific(
        &self,
        runner_id: u32,
        key: RunnerKey,
        value: SpecificValue,
    ) -> bool {
        let mut specifics = self.specifics.lock();
        let Some(slots) = specifics.get_mut(&runner_id) else {
            return false;
        };
        let index = key.index() as usize;
        if index >= WORKER_KEYS_MAX || !slots.keys[index].is_used {
            return false;
        }
        slots.values[index] = Some(value);
        true
    }

    pub(crate) fn worker_get_specific(
        &self,
        runner_id: u32,
        key: RunnerKey,
    ) -> Option<SpecificValue> {
        let specifics = self.specifics.lock();
        let slots = specifics.get(&runner_id)?;
        let index = key.index() as usize;
        if index >= WORKER_KEYS_MAX {
            return None;
        }
        slots.values[index].clone()
    }

    /// Destroys every storage slot of one runner, invoking registered
    /// destructors (outside the storage lock) on present values.
    pub(crate) fn worker_destroy_specific(&self, runner_id: u32) {
        let slots = self.specifics.lock().remove(&runner_id);
        if let Some(mut slots) = slots {
            for index in 0..WORKER_KEYS_MAX {
                if let Some(value) = slots.values[index].take() {
                    if let Some(destructor) = slots.keys[index].destructor.take() {
                        destructor(value);
                    }
                }
            }
        }
    }

    fn destroy_all_specifics(&self) {
        let runner_ids: Vec<u32> = self.specifics.lock().keys().copied().collect();
        for runner_id in runner_ids {
            self.worker_destroy_specific(runner_id);
        }
    }

    /// Takes one runner's storage for migration to another worker.
    pub(crate) fn take_specifics(&self, runner_id: u32) -> Option<RunnerSlots> {
        self.specifics.lock().remove(&runner_id)
    }

    /// Installs migrated storage for one runner.
    pub(crate) fn install_specifics(&self, runner_id: u32, slots: RunnerSlots) {
        self.specifics.lock().insert(runner_id, slots);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.is_terminated.load(Ordering::Acquire) {
            warn!(worker_id = self.id, "worker dropped without terminate");
        }
        self.destroy_all_specifics();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerOptions;
    use smallvec::smallvec;
    use std::sync::mpsc;
    use std::time::Duration;

    fn bound_runner(worker: &Arc<Worker>) -> Arc<TaskRunner> {
        let runner = Arc::new(TaskRunner::new(RunnerOptions::new()));
        worker.bind(smallvec![Arc::clone(&runner)]);
        runner
    }

    #[test]
    fn executes_posted_task_with_runner_context() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let runner = bound_runner(&worker);

        let (sender, receiver) = mpsc::channel();
        runner.post(move || {
            let current = TaskRunner::current();
            sender.send(current.id()).expect("send current id");
        });

        let observed = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("task should run");
        assert_eq!(observed, runner.id());
        worker.terminate();
        assert!(worker.is_terminated());
    }

    #[test]
    fn injected_task_runs_without_runner_context() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let (sender, receiver) = mpsc::channel();
        worker.post_immediate_task(Task::once(move || {
            sender
                .send(crate::worker::is_task_running())
                .expect("send context flag");
        }));
        let inside_task = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("injected task should run");
        assert!(!inside_task);
        worker.terminate();
    }

    #[test]
    fn charges_elapsed_time_to_the_whole_group() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let first = Arc::new(TaskRunner::new(RunnerOptions::new()));
        let second = Arc::new(TaskRunner::new(RunnerOptions::new()));
        worker.bind(smallvec![Arc::clone(&first), Arc::clone(&second)]);

        let (sender, receiver) = mpsc::channel();
        // Only the back of the group is eligible to run.
        second.post(move || {
            std::thread::sleep(Duration::from_millis(5));
            sender.send(()).expect("send completion");
        });
        receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("task should run");
        // Charging happens right after the task; give the loop a moment.
        std::thread::sleep(Duration::from_millis(20));
        assert!(first.time() > TimeDelta::ZERO, "front runner is co-billed");
        assert!(second.time() > TimeDelta::ZERO);
        worker.terminate();
    }

    #[test]
    fn only_top_of_stack_runner_runs() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let front = Arc::new(TaskRunner::new(RunnerOptions::new()));
        let back = Arc::new(TaskRunner::new(RunnerOptions::new()));
        worker.bind(smallvec![Arc::clone(&front), Arc::clone(&back)]);

        let (sender, receiver) = mpsc::channel();
        let front_sender = sender.clone();
        front.post(move || {
            front_sender.send("front").expect("send front");
        });
        back.post(move || {
            sender.send("back").expect("send back");
        });

        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(2)),
            Ok("back"),
            "only the back runner is eligible"
        );
        assert!(
            receiver.recv_timeout(Duration::from_millis(100)).is_err(),
            "front runner task must stay queued"
        );
        worker.terminate();
    }

    #[test]
    fn termination_drains_immediate_queue_when_asked() {
        let worker = Worker::spawn(String::new(), true, false).expect("spawn worker");
        let runner = bound_runner(&worker);

        // Let the binding balance in before posting the batch.
        let (ready_sender, ready_receiver) = mpsc::channel();
        runner.post(move || ready_sender.send(()).expect("send ready"));
        ready_receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("first task should run");

        let (sender, receiver) = mpsc::channel();
        for index in 0..16 {
            let sender = sender.clone();
            runner.post(move || sender.send(index).expect("send index"));
        }
        drop(sender);
        worker.terminate();

        let drained: Vec<i32> = receiver.try_iter().collect();
        assert_eq!(drained, (0..16).collect::<Vec<_>>(), "drain preserves order");
    }

    #[test]
    fn storage_slots_exhaust_at_capacity() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let runner = bound_runner(&worker);
        let runner_id = runner.id();

        for _ in 0..WORKER_KEYS_MAX {
            assert!(worker.worker_key_create(runner_id, None).is_some());
        }
        assert!(
            worker.worker_key_create(runner_id, None).is_none(),
            "all slots in use"
        );
        worker.terminate();
    }

    #[test]
    fn storage_ops_on_unknown_runner_return_sentinels() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let missing = 9_999_999;
        assert!(worker.worker_key_create(missing, None).is_none());
        assert!(!worker.worker_key_delete(missing, RunnerKey(0)));
        assert!(!worker.worker_set_specific(missing, RunnerKey(0), Arc::new(1u8)));
        assert!(worker.worker_get_specific(missing, RunnerKey(0)).is_none());
        worker.terminate();
    }

    #[test]
    fn deleted_key_clears_its_value() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let runner = bound_runner(&worker);
        let runner_id = runner.id();

        let key = worker
            .worker_key_create(runner_id, None)
            .expect("slot available");
        assert!(worker.worker_set_specific(runner_id, key, Arc::new(41u32)));
        assert!(worker.worker_key_delete(runner_id, key));
        assert!(!worker.worker_key_delete(runner_id, key), "delete is not idempotent");

        let reused = worker
            .worker_key_create(runner_id, None)
            .expect("slot recycled");
        assert_eq!(reused, key, "first free slot is reused");
        assert!(
            worker.worker_get_specific(runner_id, reused).is_none(),
            "recycled slot must not expose the previous value"
        );
        worker.terminate();
    }

    #[test]
    fn destroy_specific_invokes_destructor() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let runner = bound_runner(&worker);
        let runner_id = runner.id();

        let destroyed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&destroyed);
        let destructor: SpecificDestructor = Arc::new(move |_value| {
            flag.store(true, Ordering::SeqCst);
        });
        let key = worker
            .worker_key_create(runner_id, Some(destructor))
            .expect("slot available");
        assert!(worker.worker_set_specific(runner_id, key, Arc::new("value")));
        worker.worker_destroy_specific(runner_id);
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(
            worker.worker_get_specific(runner_id, key).is_none(),
            "storage entry is gone"
        );
        worker.terminate();
    }

    #[test]
    fn specifics_move_between_workers() {
        let from = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let to = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let runner = bound_runner(&from);
        let runner_id = runner.id();

        let key = from
            .worker_key_create(runner_id, None)
            .expect("slot available");
        assert!(from.worker_set_specific(runner_id, key, Arc::new(7u64)));

        let slots = from.take_specifics(runner_id).expect("slots present");
        to.install_specifics(runner_id, slots);

        assert!(from.worker_get_specific(runner_id, key).is_none());
        let value = to
            .worker_get_specific(runner_id, key)
            .expect("value moved");
        let value = value.downcast::<u64>().expect("type preserved");
        assert_eq!(*value, 7);
        from.terminate();
        to.terminate();
    }

    #[test]
    fn retain_keeps_front_and_unschedulable_groups() {
        let worker = Worker::spawn(String::new(), true, true).expect("spawn worker");
        let front = bound_runner(&worker);
        let pinned = Arc::new(TaskRunner::new(RunnerOptions::new().schedulable(false)));
        let movable = Arc::new(TaskRunner::new(RunnerOptions::new()));
        worker.bind(smallvec![Arc::clone(&pinned)]);
        worker.bind(smallvec![Arc::clone(&movable)]);

        // Force the pending groups into the running set.
        let (sender, receiver) = mpsc::channel();
        front.post(move || sender.send(()).expect("send ready"));
        receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("task should run");

        let moved = worker.retain_active_and_unschedulable();
        let moved_ids: Vec<u32> = moved
            .iter()
            .flat_map(|group| group.iter().map(|runner| runner.id()))
            .collect();
        assert!(!moved_ids.contains(&pinned.id()), "unschedulable stays");
        // The front group (whichever sorted first) also stays.
        assert!(moved_ids.len() <= 1);
        worker.terminate();
    }
}
