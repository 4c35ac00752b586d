//! End-to-end scheduler behaviour: ordering, priorities, serial
//! execution, sub-runner stacking, migration, and the queue primitives.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use strand::test_logging::TestLogger;
use strand::{
    LinkedQueue, RingQueue, RunnerOptions, RunnerKey, TaskRunner, TimeDelta, Worker,
    WorkerManager,
};

fn init_logging() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn recv_ok<T>(receiver: &mpsc::Receiver<T>) -> T {
    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("scheduler should make progress")
}

#[test]
fn tasks_on_one_runner_run_in_posting_order() {
    init_logging();
    let manager = WorkerManager::new(1);
    let runner = manager.create_task_runner(RunnerOptions::new().name("fifo"));

    let buffer = Arc::new(Mutex::new(String::new()));
    let (sender, receiver) = mpsc::channel();
    for label in ["a", "b", "c"] {
        let buffer = Arc::clone(&buffer);
        let sender = sender.clone();
        runner.post(move || {
            buffer.lock().push_str(label);
            if label == "c" {
                sender.send(()).expect("send completion");
            }
        });
    }
    recv_ok(&receiver);
    assert_eq!(*buffer.lock(), "abc");
    manager.terminate();
}

#[test]
fn delayed_task_runs_after_immediate_and_not_before_deadline() {
    let manager = WorkerManager::new(1);
    let runner = manager.create_task_runner(RunnerOptions::new().name("delays"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let (sender, receiver) = mpsc::channel();

    let posted_at = Instant::now();
    let late_order = Arc::clone(&order);
    let late_sender = sender.clone();
    runner.post_delayed(
        move || {
            late_order.lock().push(("late", Instant::now()));
            late_sender.send(()).expect("send late");
        },
        TimeDelta::from_millis(100),
    );
    let early_order = Arc::clone(&order);
    runner.post(move || {
        early_order.lock().push(("early", Instant::now()));
    });

    recv_ok(&receiver);
    let order = order.lock();
    assert_eq!(order[0].0, "early");
    assert_eq!(order[1].0, "late");
    assert!(
        order[1].1.duration_since(posted_at) >= Duration::from_millis(100),
        "delayed task must not run before its deadline"
    );
    manager.terminate();
}

#[test]
fn at_most_one_task_of_a_runner_executes_process_wide() {
    let manager = WorkerManager::new(4);
    let runner = manager.create_task_runner(RunnerOptions::new().name("serial"));

    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let remaining = Arc::new(AtomicUsize::new(50));
    let (sender, receiver) = mpsc::channel();

    for _ in 0..50 {
        let in_flight = Arc::clone(&in_flight);
        let overlapped = Arc::clone(&overlapped);
        let remaining = Arc::clone(&remaining);
        let sender = sender.clone();
        runner.post(move || {
            if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                sender.send(()).expect("send completion");
            }
        });
    }

    recv_ok(&receiver);
    assert!(
        !overlapped.load(Ordering::SeqCst),
        "two tasks of one runner overlapped"
    );
    manager.terminate();
}

#[test]
fn lower_priority_value_wins_more_slots_on_a_shared_worker() {
    let manager = WorkerManager::new(1);
    let urgent = manager.create_task_runner(RunnerOptions::new().name("urgent").priority(1));
    let relaxed = manager.create_task_runner(RunnerOptions::new().name("relaxed").priority(10));

    let urgent_count = Arc::new(AtomicUsize::new(0));
    let relaxed_count = Arc::new(AtomicUsize::new(0));

    let spin = || {
        let start = Instant::now();
        while start.elapsed() < Duration::from_micros(100) {
            std::hint::spin_loop();
        }
    };

    for _ in 0..1_000 {
        let counter = Arc::clone(&urgent_count);
        urgent.post(move || {
            spin();
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = Arc::clone(&relaxed_count);
        relaxed.post(move || {
            spin();
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    thread::sleep(Duration::from_millis(100));
    let urgent_seen = urgent_count.load(Ordering::Relaxed);
    let relaxed_seen = relaxed_count.load(Ordering::Relaxed);
    manager.terminate();

    assert!(
        urgent_seen >= relaxed_seen,
        "priority 1 runner ran {urgent_seen} tasks, priority 10 runner ran {relaxed_seen}"
    );
}

#[test]
fn sub_runner_stacks_above_its_parent() {
    let manager = WorkerManager::new(1);
    let parent = manager.create_task_runner(RunnerOptions::new().name("parent"));
    let child = Arc::new(TaskRunner::new(RunnerOptions::new().name("child")));

    let order = Arc::new(Mutex::new(Vec::new()));
    let (sender, receiver) = mpsc::channel();

    let outer_parent = Arc::clone(&parent);
    let outer_child = Arc::clone(&child);
    let outer_order = Arc::clone(&order);
    parent.post(move || {
        // Queue child work and the parent follow-ups it will request.
        for index in 1..=3 {
            let order = Arc::clone(&outer_order);
            let follow_order = Arc::clone(&outer_order);
            let follow_sender = sender.clone();
            let parent = Arc::clone(&outer_parent);
            outer_child.post(move || {
                order.lock().push(format!("child-{index}"));
                parent.post(move || {
                    follow_order.lock().push(format!("follow-{index}"));
                    if index == 3 {
                        follow_sender.send(()).expect("send completion");
                    }
                });
            });
        }
        let pump_parent = Arc::clone(&outer_parent);
        let unstack_child = Arc::clone(&outer_child);
        outer_child.post(move || {
            pump_parent
                .remove_sub_task_runner(&unstack_child)
                .expect("child is stacked");
        });

        // Nested pump: blocks here until the child is removed.
        outer_parent
            .add_sub_task_runner(&outer_child, true)
            .expect("parent is bound");
        outer_order.lock().push("parent-resumed".to_string());
    });

    recv_ok(&receiver);
    let order = order.lock().clone();
    assert_eq!(
        order,
        vec![
            "child-1",
            "child-2",
            "child-3",
            "parent-resumed",
            "follow-1",
            "follow-2",
            "follow-3",
        ],
        "posts to the parent must wait for the sub-runner to unstack"
    );
    manager.terminate();
}

#[test]
fn migration_preserves_runner_local_storage() {
    init_logging();
    let logger = TestLogger::from_env();
    let manager = WorkerManager::new(1);
    let first = manager.create_task_runner(RunnerOptions::new().name("first"));
    let second = manager.create_task_runner(RunnerOptions::new().name("second"));

    // Both runners store a value under a fresh key from inside a task.
    let mut keys = Vec::new();
    for (runner, value) in [(&first, 41_i32), (&second, 42_i32)] {
        let (sender, receiver) = mpsc::channel();
        let task_runner = Arc::clone(runner);
        runner.post(move || {
            let key = task_runner.key_create(None).expect("storage slot free");
            assert!(task_runner.set_specific(key, Arc::new(value)));
            sender.send(key).expect("send key");
        });
        keys.push(recv_ok(&receiver));
    }
    logger.info("storage written on the original worker");

    let before = (
        first.worker().map(|w| w.id()),
        second.worker().map(|w| w.id()),
    );
    manager.resize(3);
    let after = (
        first.worker().map(|w| w.id()),
        second.worker().map(|w| w.id()),
    );
    logger.info(format!("workers before {before:?}, after {after:?}"));
    assert_ne!(
        after.0, after.1,
        "growing the pool should separate the two runner groups"
    );

    // Values read back from the (possibly new) workers.
    for (runner, key, expected) in [(&first, keys[0], 41_i32), (&second, keys[1], 42_i32)] {
        let (sender, receiver) = mpsc::channel();
        let task_runner = Arc::clone(runner);
        let key: RunnerKey = key;
        runner.post(move || {
            let value = task_runner
                .get_specific(key)
                .expect("value survives migration");
            let value = value.downcast::<i32>().expect("stored type");
            sender.send(*value).expect("send value");
        });
        let observed = recv_ok(&receiver);
        if observed != expected {
            panic!(
                "storage lost in migration: got {observed}, want {expected}\n{}",
                logger.report()
            );
        }
    }
    manager.terminate();
}

#[test]
fn cancelled_task_is_skipped() {
    let manager = WorkerManager::new(1);
    let runner = manager.create_task_runner(RunnerOptions::new().name("cancel"));

    let (gate_sender, gate_receiver) = mpsc::channel::<()>();
    let (done_sender, done_receiver) = mpsc::channel();
    let hits = Arc::new(AtomicUsize::new(0));

    // Block the worker so the cancel lands before execution starts.
    runner.post(move || {
        gate_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("gate opens");
    });
    let counter = Arc::clone(&hits);
    let cancelled = runner.post(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    runner.post(move || done_sender.send(()).expect("send completion"));

    cancelled.cancel();
    gate_sender.send(()).expect("open gate");

    recv_ok(&done_receiver);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "cancelled thunk must not run");
    manager.terminate();
}

#[test]
fn idle_task_runs_in_the_slack_before_a_deadline() {
    let manager = WorkerManager::new(1);
    let runner = manager.create_task_runner(RunnerOptions::new().name("idle"));

    let (sender, receiver) = mpsc::channel();
    runner.post_delayed(|| {}, TimeDelta::from_millis(200));
    runner.post_idle(move |param| {
        sender.send(param).expect("send idle budget");
    });

    let param = recv_ok(&receiver);
    assert!(!param.did_time_out);
    assert!(
        param.res_time > TimeDelta::ZERO && param.res_time <= TimeDelta::from_millis(200),
        "idle budget should reflect the pending deadline, got {}",
        param.res_time
    );
    manager.terminate();
}

#[test]
fn join_handle_returns_the_task_value() {
    let manager = WorkerManager::new(1);
    let runner = manager.create_task_runner(RunnerOptions::new().name("results"));

    let handle = runner.post_with_result(|| 6 * 7);
    assert_eq!(handle.join(), Some(42));

    let cancelled = runner.post_with_result(|| "never");
    cancelled.task().cancel();
    assert_eq!(cancelled.join(), None, "cancelled tasks produce no value");
    manager.terminate();
}

#[test]
fn loop_driver_worker_is_pumped_by_the_host() {
    struct RecordingDriver {
        wakes: Mutex<Vec<TimeDelta>>,
    }

    impl strand::LoopDriver for RecordingDriver {
        fn schedule_wake(&self, delay: TimeDelta) {
            self.wakes.lock().push(delay);
        }
    }

    let driver = Arc::new(RecordingDriver {
        wakes: Mutex::new(Vec::new()),
    });
    let worker = Worker::with_loop_driver("host-loop", Arc::clone(&driver) as Arc<dyn strand::LoopDriver>);

    let manager = WorkerManager::new(1);
    manager.add_worker(Arc::clone(&worker));
    // Round-robin: first runner lands on the thread worker, the second
    // on the loop worker.
    let _thread_runner = manager.create_task_runner(RunnerOptions::new());
    let loop_runner = manager.create_task_runner(RunnerOptions::new().name("on-loop"));
    assert_eq!(
        loop_runner.worker().expect("bound").id(),
        worker.id(),
        "second runner should land on the loop worker"
    );

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    loop_runner.post(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(
        !driver.wakes.lock().is_empty(),
        "posting must ask the host loop for a wake"
    );

    // The host loop fires: run everything ready.
    worker.poll();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    worker.terminate();
    manager.terminate();
}

#[test]
fn ring_queue_capacity_semantics() {
    let queue = RingQueue::new(4);
    for value in 1..=4 {
        assert!(queue.push(value));
    }
    assert!(!queue.push(5), "queue of capacity 4 is full");
    assert_eq!(queue.pop(), Some(1));
    assert!(queue.push(5), "pop frees a slot");
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), Some(3));
    assert_eq!(queue.pop(), Some(4));
    assert_eq!(queue.pop(), Some(5));
}

#[test]
fn linked_queue_conserves_values_across_threads() {
    let queue = Arc::new(LinkedQueue::new());
    let total = 4 * 500;

    let producers: Vec<_> = (0..4u32)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..500u32 {
                    queue.push(p * 1_000 + i);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer finished");
    }

    let mut seen = std::collections::HashSet::new();
    while let Some(value) = queue.pop() {
        assert!(seen.insert(value), "value {value} popped twice");
    }
    assert_eq!(seen.len(), total, "every pushed value was popped once");
}
