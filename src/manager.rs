//! The worker pool owner.
//!
//! A [`WorkerManager`] owns the workers, creates task runners, and
//! rebalances runners between workers when the pool is resized. Runner
//! placement is round-robin, except that a non-zero group id co-locates
//! the new runner with the worker already carrying that group.
//!
//! Migration during [`resize`](WorkerManager::resize) moves a runner's
//! group binding and its runner-local storage; the runner's queues are
//! never touched, and runners that are unschedulable or currently at the
//! front of a worker's running set stay put.

use parking_lot::Mutex;
use smallvec::smallvec;
use std::sync::{Arc, OnceLock};

use crate::config::ManagerConfig;
use crate::runner::{RunnerOptions, TaskRunner, DEFAULT_GROUP_ID};
use crate::tracing_compat::{debug, warn};
use crate::worker::{RunnerGroup, Worker};

/// Owns the worker pool and the runners created through it.
pub struct WorkerManager {
    config: ManagerConfig,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    workers: Vec<Arc<Worker>>,
    runners: Vec<Arc<TaskRunner>>,
    /// Round-robin cursor for placement.
    index: usize,
}

impl WorkerManager {
    /// Creates a pool of `size` thread-backed workers (at least one).
    #[must_use]
    pub fn new(size: usize) -> Arc<Self> {
        Self::with_config(ManagerConfig::default().worker_threads(size))
    }

    /// Creates a pool from an explicit configuration.
    ///
    /// Worker threads that cannot be spawned (OS resource exhaustion)
    /// are skipped with a warning, leaving the pool smaller than asked.
    #[must_use]
    pub fn with_config(config: ManagerConfig) -> Arc<Self> {
        let size = config.worker_threads_or_default();
        let workers: Vec<Arc<Worker>> = (0..size)
            .filter_map(|index| Self::spawn_worker(&config, index))
            .collect();
        if workers.len() < size {
            warn!(
                requested = size,
                spawned = workers.len(),
                "worker pool created short-handed"
            );
        }
        debug!(size = workers.len(), "worker pool created");
        Arc::new(Self {
            config,
            state: Mutex::new(ManagerState {
                workers,
                runners: Vec::new(),
                index: 0,
            }),
        })
    }

    /// The lazily created process-wide manager, sized from the
    /// environment (`STRAND_*` variables) or machine parallelism.
    #[must_use]
    pub fn default_manager() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<WorkerManager>> = OnceLock::new();
        Arc::clone(DEFAULT.get_or_init(|| {
            let config = ManagerConfig::from_env().unwrap_or_else(|error| {
                warn!(%error, "invalid scheduler environment, using defaults");
                ManagerConfig::default()
            });
            Self::with_config(config)
        }))
    }

    fn spawn_worker(config: &ManagerConfig, index: usize) -> Option<Arc<Worker>> {
        match Worker::spawn(
            format!("{}-{index}", config.name_prefix()),
            true,
            config.is_exit_immediately(),
        ) {
            Ok(worker) => Some(worker),
            Err(error) => {
                warn!(%error, index, "could not spawn worker thread");
                None
            }
        }
    }

    /// The current pool size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Attaches an externally constructed worker (e.g. one driven by a
    /// host run-loop) to the pool.
    pub fn add_worker(&self, worker: Arc<Worker>) {
        self.state.lock().workers.push(worker);
    }

    /// Creates a runner and binds it to a worker.
    ///
    /// Placement: a non-zero group id joins the worker already carrying
    /// that group; otherwise workers are used round-robin.
    pub fn create_task_runner(&self, options: RunnerOptions) -> Arc<TaskRunner> {
        let runner = Arc::new(TaskRunner::new(options));
        let mut state = self.state.lock();
        if state.workers.is_empty() {
            // No worker could be spawned; the runner stays unbound and
            // posts to it degrade to silent drops.
            warn!(runner_id = runner.id(), "no workers available, runner left unbound");
            state.runners.push(Arc::clone(&runner));
            return runner;
        }
        let colocated = if runner.group_id() == DEFAULT_GROUP_ID {
            None
        } else {
            state
                .workers
                .iter()
                .find(|worker| worker.group_id() == runner.group_id())
                .cloned()
        };
        let target = colocated.unwrap_or_else(|| {
            let worker = Arc::clone(&state.workers[state.index]);
            state.index = (state.index + 1) % state.workers.len();
            worker
        });
        debug!(
            runner_id = runner.id(),
            worker_id = target.id(),
            "task runner created"
        );
        target.bind(smallvec![Arc::clone(&runner)]);
        state.runners.push(Arc::clone(&runner));
        runner
    }

    /// Unbinds a runner from its worker and destroys its runner-local
    /// storage there.
    pub fn remove_task_runner(&self, runner: &Arc<TaskRunner>) {
        {
            let mut state = self.state.lock();
            state.runners.retain(|kept| !Arc::ptr_eq(kept, runner));
        }
        if let Some(worker) = runner.worker() {
            worker.unbind_runner(runner);
            worker.worker_destroy_specific(runner.id());
        }
        runner.clear_worker();
        debug!(runner_id = runner.id(), "task runner removed");
    }

    /// Grows or shrinks the pool to `size` workers (at least one).
    ///
    /// Growing spawns workers and redistributes every migratable group
    /// round-robin across the pool. Shrinking unbinds everything from
    /// the removed workers, redistributes to the survivors, and
    /// terminates the removed workers synchronously.
    pub fn resize(&self, size: usize) {
        let size = size.max(1);
        let mut state = self.state.lock();
        if size == state.workers.len() {
            return;
        }
        debug!(from = state.workers.len(), to = size, "resizing worker pool");
        if size > state.workers.len() {
            self.grow(&mut state, size);
        } else {
            Self::shrink(&mut state, size);
        }
    }

    fn grow(&self, state: &mut ManagerState, new_size: usize) {
        let old_size = state.workers.len();
        for index in old_size..new_size {
            if let Some(worker) = Self::spawn_worker(&self.config, index) {
                state.workers.push(worker);
            }
        }
        if state.workers.len() == old_size {
            // Nothing was spawned; keep the current layout untouched.
            return;
        }

        let mut migrations: Vec<(Arc<Worker>, RunnerGroup)> = Vec::new();
        for worker in &state.workers[..old_size] {
            for group in worker.retain_active_and_unschedulable() {
                migrations.push((Arc::clone(worker), group));
            }
        }

        // Start filling the new workers first.
        state.index = old_size;
        for (from, group) in migrations {
            let Some(to) = Self::next_target(state) else {
                // No schedulable target; rebind where the group came from.
                from.bind(group);
                continue;
            };
            Self::migrate_group(&from, &to, group);
        }
    }

    fn shrink(state: &mut ManagerState, new_size: usize) {
        if state.index >= new_size {
            state.index = 0;
        }
        let removed = state.workers.split_off(new_size);
        for worker in removed {
            let mut groups = worker.unbind_all();
            groups.extend(worker.release_pending());
            for group in groups {
                let Some(to) = Self::next_target(state) else {
                    warn!("no schedulable survivor for migrated group");
                    continue;
                };
                Self::migrate_group(&worker, &to, group);
            }
            worker.terminate();
        }
    }

    /// Round-robin over schedulable workers starting at the cursor.
    fn next_target(state: &mut ManagerState) -> Option<Arc<Worker>> {
        let count = state.workers.len();
        if count == 0 {
            return None;
        }
        if state.index >= count {
            state.index = 0;
        }
        for _ in 0..count {
            let worker = Arc::clone(&state.workers[state.index]);
            state.index = (state.index + 1) % count;
            if worker.is_schedulable() {
                return Some(worker);
            }
        }
        None
    }

    /// Moves one group from `from` to `to`: runner-local storage first,
    /// then the binding (which updates back-references and notifies).
    fn migrate_group(from: &Arc<Worker>, to: &Arc<Worker>, group: RunnerGroup) {
        if Arc::ptr_eq(from, to) {
            to.bind(group);
            return;
        }
        for runner in &group {
            if let Some(slots) = from.take_specifics(runner.id()) {
                to.install_specifics(runner.id(), slots);
            }
            debug!(
                runner_id = runner.id(),
                from_worker = from.id(),
                to_worker = to.id(),
                "runner migrated"
            );
        }
        to.bind(group);
    }

    /// Terminates every worker, joining their threads. Idempotent.
    pub fn terminate(&self) {
        let workers: Vec<Arc<Worker>> = self.state.lock().workers.clone();
        for worker in workers {
            worker.terminate();
        }
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkerManager")
            .field("workers", &state.workers.len())
            .field("runners", &state.runners.len())
            .finish_non_exhaustive()
    }
}
