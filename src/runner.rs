//! Serial task queues.
//!
//! A [`TaskRunner`] is a logically serial queue identified by a
//! process-unique id. It owns three independent queues — immediate
//! (FIFO), delayed (min-heap by deadline), and idle (FIFO) — and a weak
//! back-reference to the worker currently executing it. Runners never
//! execute anything themselves; a bound [`Worker`](crate::Worker) pulls
//! from them via [`get_next`](TaskRunner::get_next).
//!
//! Because a runner is bound to at most one worker at a time and a
//! worker runs one task at a time, a runner's tasks are globally serial.

use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Weak};

use crate::error::RunnerError;
use crate::task::{IdleCallbackParam, IdleTask, Task, TaskHandle};
use crate::time::{TimeDelta, TimePoint};
use crate::tracing_compat::{debug, trace};
use crate::worker::{self, SpecificDestructor, SpecificValue, Worker};

/// The group id meaning "no co-location constraint".
pub const DEFAULT_GROUP_ID: u32 = 0;

static NEXT_RUNNER_ID: AtomicU32 = AtomicU32::new(0);

/// A key into a runner's runner-local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunnerKey(pub(crate) u32);

impl RunnerKey {
    /// The slot index this key addresses.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Options for creating a [`TaskRunner`].
///
/// ```ignore
/// let options = RunnerOptions::new().name("raster").priority(2);
/// let runner = manager.create_task_runner(options);
/// ```
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    group_id: u32,
    priority: u32,
    is_schedulable: bool,
    name: String,
}

impl RunnerOptions {
    /// Creates options with the defaults: no group constraint, priority
    /// 1, schedulable, empty name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            group_id: DEFAULT_GROUP_ID,
            priority: 1,
            is_schedulable: true,
            name: String::new(),
        }
    }

    /// Forces co-location with other runners of the same non-zero group
    /// id on a single worker.
    #[must_use]
    pub fn group_id(mut self, group_id: u32) -> Self {
        self.group_id = group_id;
        self
    }

    /// Sets the scheduling priority. Lower integers are scheduled more
    /// eagerly; the ordering weight is `priority * accumulated_time`.
    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// When false, the runner is pinned to the worker it is first bound
    /// to and never migrates during pool resizes.
    #[must_use]
    pub fn schedulable(mut self, is_schedulable: bool) -> Self {
        self.is_schedulable = is_schedulable;
        self
    }

    /// Human-readable label, used in logs only.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry in the delayed-task min-heap.
///
/// Ordered earliest-deadline-first with an insertion sequence tiebreak
/// so equal deadlines stay FIFO.
struct DelayedEntry {
    deadline: TimePoint,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed for min-heap behaviour atop BinaryHeap's max-heap.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct DelayedQueue {
    heap: BinaryHeap<DelayedEntry>,
    next_seq: u64,
}

impl DelayedQueue {
    fn push(&mut self, deadline: TimePoint, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(DelayedEntry {
            deadline,
            seq,
            task,
        });
    }

    fn pop_ready(&mut self, now: TimePoint) -> Option<Task> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|entry| entry.task)
    }

    fn peek_deadline(&self) -> Option<TimePoint> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

/// A serial task queue bound to at most one worker at a time.
pub struct TaskRunner {
    id: u32,
    name: String,
    group_id: u32,
    priority: u32,
    is_schedulable: bool,
    time_nanos: AtomicI64,
    has_sub_runner: AtomicBool,
    worker: RwLock<Weak<Worker>>,
    // Lock order: `immediate` before `delayed` when both are held.
    immediate: Mutex<VecDeque<Task>>,
    delayed: Mutex<DelayedQueue>,
    idle: Mutex<VecDeque<IdleTask>>,
}

impl TaskRunner {
    /// Creates an unbound runner. Prefer
    /// [`WorkerManager::create_task_runner`](crate::WorkerManager::create_task_runner),
    /// which also binds the runner to a worker.
    #[must_use]
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            id: NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed),
            name: options.name,
            group_id: options.group_id,
            priority: options.priority,
            is_schedulable: options.is_schedulable,
            time_nanos: AtomicI64::new(0),
            has_sub_runner: AtomicBool::new(false),
            worker: RwLock::new(Weak::new()),
            immediate: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(DelayedQueue::default()),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// The process-unique runner id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The human-readable label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The co-location group id (0 = unconstrained).
    #[must_use]
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// The scheduling priority (lower = higher priority).
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// False when the runner is pinned to its worker.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.is_schedulable
    }

    /// The wall-time accumulated by tasks of this runner's group.
    #[must_use]
    pub fn time(&self) -> TimeDelta {
        TimeDelta::from_nanos(self.time_nanos.load(Ordering::Relaxed))
    }

    /// Overwrites the accumulated time (used when rebalancing).
    pub fn set_time(&self, time: TimeDelta) {
        self.time_nanos.store(time.as_nanos(), Ordering::Relaxed);
    }

    /// Adds to the accumulated time, returning the new total.
    pub fn add_time(&self, elapsed: TimeDelta) -> TimeDelta {
        let total = self
            .time_nanos
            .fetch_add(elapsed.as_nanos(), Ordering::Relaxed)
            .saturating_add(elapsed.as_nanos());
        TimeDelta::from_nanos(total)
    }

    /// The runner whose task is currently executing on the calling
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics when no task is executing on this thread.
    #[must_use]
    pub fn current() -> Arc<Self> {
        worker::current_task_runner()
            .expect("TaskRunner::current cannot be called outside of a task")
    }

    /// Non-panicking variant of [`current`](Self::current).
    #[must_use]
    pub fn try_current() -> Option<Arc<Self>> {
        worker::current_task_runner()
    }

    // ------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------

    /// Appends a task to the immediate queue and notifies the worker.
    pub fn post_task(&self, task: Task) {
        self.immediate.lock().push_back(task);
        trace!(runner_id = self.id, "task posted");
        self.notify_worker();
    }

    /// Wraps a closure into a [`Task`], posts it, and returns the task
    /// handle (e.g. for cancellation).
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) -> Task {
        let task = Task::once(callback);
        self.post_task(task.clone());
        task
    }

    /// Posts a value-producing closure and returns a handle whose
    /// [`join`](TaskHandle::join) blocks until the value is available.
    pub fn post_with_result<R: Send + 'static>(
        &self,
        callback: impl FnOnce() -> R + Send + 'static,
    ) -> TaskHandle<R> {
        let (sender, receiver) = mpsc::channel();
        let task = Task::once(move || {
            let _ = sender.send(callback());
        });
        self.post_task(task.clone());
        TaskHandle::new(task, receiver)
    }

    /// Inserts a task into the delayed queue with deadline `now + delay`
    /// and notifies the worker.
    ///
    /// A zero delay still goes through the delayed queue; the task is
    /// promoted at the worker's next merge step rather than aliasing
    /// [`post_task`](Self::post_task).
    pub fn post_delayed_task(&self, task: Task, delay: TimeDelta) {
        let deadline = TimePoint::now() + delay;
        self.delayed.lock().push(deadline, task);
        trace!(runner_id = self.id, delay_ms = delay.as_millis(), "delayed task posted");
        self.notify_worker();
    }

    /// Closure convenience for [`post_delayed_task`](Self::post_delayed_task).
    pub fn post_delayed(&self, callback: impl FnOnce() + Send + 'static, delay: TimeDelta) -> Task {
        let task = Task::once(callback);
        self.post_delayed_task(task.clone(), delay);
        task
    }

    /// Appends an idle task and notifies the worker.
    pub fn post_idle_task(&self, task: IdleTask) {
        self.idle.lock().push_back(task);
        trace!(runner_id = self.id, "idle task posted");
        self.notify_worker();
    }

    /// Closure convenience for [`post_idle_task`](Self::post_idle_task).
    pub fn post_idle(
        &self,
        callback: impl FnOnce(IdleCallbackParam) + Send + 'static,
    ) -> IdleTask {
        let task = IdleTask::once(callback);
        self.post_idle_task(task.clone());
        task
    }

    /// Empties all three queues without running anything.
    pub fn clear(&self) {
        self.immediate.lock().clear();
        self.delayed.lock().clear();
        self.idle.lock().clear();
    }

    // ------------------------------------------------------------------
    // Sub-runners
    // ------------------------------------------------------------------

    /// Appends `sub_runner` to this runner's group on the bound worker,
    /// making it the group's new top-of-stack.
    ///
    /// With `is_task_running` true (the caller is inside a task of this
    /// runner), the worker enters stacking mode and this call pumps the
    /// worker loop until [`remove_sub_task_runner`](Self::remove_sub_task_runner)
    /// is called — a synchronous nested event pump. While pumping, only
    /// the top-of-stack runner of this group is eligible to run.
    pub fn add_sub_task_runner(
        &self,
        sub_runner: &Arc<TaskRunner>,
        is_task_running: bool,
    ) -> Result<(), RunnerError> {
        let worker = self.worker().ok_or(RunnerError::NoWorkerBound)?;
        debug!(
            runner_id = self.id,
            sub_runner_id = sub_runner.id(),
            "sub-runner bound"
        );
        worker.bind_group(self.id, Arc::clone(sub_runner));
        self.has_sub_runner.store(true, Ordering::Release);
        worker.notify();
        if is_task_running {
            worker.set_stacking_mode(true);
            while self.has_sub_runner.load(Ordering::Acquire) {
                if !worker.run_task() {
                    break;
                }
            }
            worker.set_stacking_mode(false);
        }
        Ok(())
    }

    /// Unbinds `sub_runner` from the worker and exits stacking mode.
    pub fn remove_sub_task_runner(&self, sub_runner: &Arc<TaskRunner>) -> Result<(), RunnerError> {
        if !self.has_sub_runner.load(Ordering::Acquire) {
            return Err(RunnerError::NoSubRunner);
        }
        let worker = self.worker().ok_or(RunnerError::NoWorkerBound)?;
        worker.unbind_runner(sub_runner);
        sub_runner.clear_worker();
        self.has_sub_runner.store(false, Ordering::Release);
        debug!(
            runner_id = self.id,
            sub_runner_id = sub_runner.id(),
            "sub-runner removed"
        );
        worker.notify();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling (worker-facing)
    // ------------------------------------------------------------------

    /// The delay until the next delayed task's deadline, or
    /// [`TimeDelta::MAX`] when the delayed queue is empty.
    #[must_use]
    pub fn next_time_delta(&self, now: TimePoint) -> TimeDelta {
        self.delayed
            .lock()
            .peek_deadline()
            .map_or(TimeDelta::MAX, |deadline| deadline - now)
    }

    /// Merge step: promotes every delayed task whose deadline has passed
    /// onto the immediate queue (under the joint lock of both queues),
    /// then pops the front of the immediate queue.
    pub(crate) fn get_next(&self) -> Option<Task> {
        let now = TimePoint::now();
        let mut immediate = self.immediate.lock();
        let mut delayed = self.delayed.lock();
        while let Some(task) = delayed.pop_ready(now) {
            immediate.push_back(task);
        }
        immediate.pop_front()
    }

    /// Pops the front of the immediate queue only (termination drain).
    pub(crate) fn pop_task(&self) -> Option<Task> {
        self.immediate.lock().pop_front()
    }

    /// Pops the oldest idle task.
    pub(crate) fn pop_idle_task(&self) -> Option<IdleTask> {
        self.idle.lock().pop_front()
    }

    // ------------------------------------------------------------------
    // Worker binding
    // ------------------------------------------------------------------

    pub(crate) fn bind_worker(&self, worker: &Arc<Worker>) {
        *self.worker.write() = Arc::downgrade(worker);
    }

    pub(crate) fn clear_worker(&self) {
        *self.worker.write() = Weak::new();
    }

    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.read().upgrade()
    }

    fn notify_worker(&self) {
        if let Some(worker) = self.worker() {
            worker.notify();
        } else {
            trace!(runner_id = self.id, "post with no bound worker");
        }
    }

    // ------------------------------------------------------------------
    // Runner-local storage
    // ------------------------------------------------------------------

    /// Allocates a storage key on the bound worker, with an optional
    /// destructor invoked when the slot is destroyed with a value still
    /// present.
    ///
    /// Returns `None` when all [`WORKER_KEYS_MAX`](crate::WORKER_KEYS_MAX)
    /// slots are in use.
    ///
    /// # Panics
    ///
    /// Panics when called outside a task of this runner.
    #[must_use]
    pub fn key_create(&self, destructor: Option<SpecificDestructor>) -> Option<RunnerKey> {
        let worker = self.storage_worker("RunnerKeyCreate");
        worker.worker_key_create(self.id, destructor)
    }

    /// Releases a storage key (and drops any value in its slot).
    ///
    /// Returns false for an unknown or unused key.
    ///
    /// # Panics
    ///
    /// Panics when called outside a task of this runner.
    pub fn key_delete(&self, key: RunnerKey) -> bool {
        let worker = self.storage_worker("RunnerKeyDelete");
        worker.worker_key_delete(self.id, key)
    }

    /// Stores a value under `key`. Returns false for an unknown key.
    ///
    /// # Panics
    ///
    /// Panics when called outside a task of this runner.
    pub fn set_specific(&self, key: RunnerKey, value: SpecificValue) -> bool {
        let worker = self.storage_worker("RunnerSetSpecific");
        worker.worker_set_specific(self.id, key, value)
    }

    /// Reads the value stored under `key`, if any.
    ///
    /// # Panics
    ///
    /// Panics when called outside a task of this runner.
    #[must_use]
    pub fn get_specific(&self, key: RunnerKey) -> Option<SpecificValue> {
        let worker = self.storage_worker("RunnerGetSpecific");
        worker.worker_get_specific(self.id, key)
    }

    /// Destroys every storage slot of this runner on its worker,
    /// invoking registered destructors on present values.
    ///
    /// # Panics
    ///
    /// Panics when called outside a task of this runner.
    pub fn destroy_specifics(&self) {
        let worker = self.storage_worker("RunnerDestroySpecifics");
        worker.worker_destroy_specific(self.id);
    }

    fn storage_worker(&self, op: &str) -> Arc<Worker> {
        let current = worker::current_task_runner()
            .unwrap_or_else(|| panic!("{op} cannot be called outside of a task"));
        assert_eq!(
            current.id(),
            self.id,
            "{op} must be called from a task of this runner"
        );
        self.worker()
            .unwrap_or_else(|| panic!("{op} requires the runner to be bound to a worker"))
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.read().upgrade() {
            worker.worker_destroy_specific(self.id);
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("priority", &self.priority)
            .field("is_schedulable", &self.is_schedulable)
            .finish_non_exhaustive()
    }
}
