//! Thread parking for thread-backed workers.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A permit-model parking primitive.
///
/// [`unpark`](Self::unpark) publishes a single permit;
/// [`park`](Self::park) consumes it, blocking until one is available.
/// Multiple unparks coalesce into one permit, so a notification arriving
/// before the park is never lost and never accumulates.
#[derive(Debug, Clone, Default)]
pub struct Parker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    notified: AtomicBool,
    mutex: Mutex<()>,
    cvar: Condvar,
}

impl Parker {
    /// Creates a new parker with no pending permit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_consume_permit(&self) -> bool {
        self.inner.notified.swap(false, Ordering::Acquire)
    }

    /// Blocks the calling thread until a permit is available.
    pub fn park(&self) {
        if self.try_consume_permit() {
            return;
        }
        let mut guard = self.inner.mutex.lock();
        loop {
            if self.try_consume_permit() {
                return;
            }
            self.inner.cvar.wait(&mut guard);
        }
    }

    /// Blocks until a permit is available or `timeout` elapses.
    pub fn park_timeout(&self, timeout: Duration) {
        if self.try_consume_permit() {
            return;
        }
        if timeout.is_zero() {
            return;
        }
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
        let mut guard = self.inner.mutex.lock();
        loop {
            if self.try_consume_permit() {
                return;
            }
            if self.inner.cvar.wait_until(&mut guard, deadline).timed_out() {
                // Best effort: consume a permit that raced the timeout so
                // it is not spuriously delivered to a later park.
                let _ = self.try_consume_permit();
                return;
            }
        }
    }

    /// Publishes a permit, waking one parked thread if any.
    ///
    /// Fast path: when a permit is already pending the atomic swap
    /// returns early without touching the mutex or condvar.
    pub fn unpark(&self) {
        if self.inner.notified.swap(true, Ordering::Release) {
            return;
        }
        // The permit is published; take the mutex before signalling so a
        // thread between its permit check and its wait cannot miss the
        // notification.
        let _guard = self.inner.mutex.lock();
        self.inner.cvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn park_then_unpark_wakes() {
        let parker = Parker::new();
        let woken = Arc::new(AtomicBool::new(false));

        let thread_parker = parker.clone();
        let thread_woken = Arc::clone(&woken);
        let handle = thread::spawn(move || {
            thread_parker.park();
            thread_woken.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(10));
        parker.unpark();
        handle.join().expect("parked thread should complete");
        assert!(woken.load(Ordering::SeqCst));
    }

    #[test]
    fn unpark_before_park_does_not_block() {
        let parker = Parker::new();
        parker.unpark();

        let start = Instant::now();
        parker.park();
        assert!(
            start.elapsed() < Duration::from_millis(50),
            "park after unpark should return immediately"
        );
    }

    #[test]
    fn unparks_coalesce_to_one_permit() {
        let parker = Parker::new();
        parker.unpark();
        parker.unpark();
        parker.unpark();

        parker.park();

        let start = Instant::now();
        parker.park_timeout(Duration::from_millis(30));
        assert!(
            start.elapsed() >= Duration::from_millis(20),
            "second park should block (single permit was consumed)"
        );
    }

    #[test]
    fn park_timeout_expires() {
        let parker = Parker::new();
        let start = Instant::now();
        parker.park_timeout(Duration::from_millis(50));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "waited {elapsed:?}");
    }

    #[test]
    fn unpark_interrupts_park_timeout() {
        let parker = Parker::new();
        let thread_parker = parker.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            thread_parker.park_timeout(Duration::from_secs(10));
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(20));
        parker.unpark();
        let elapsed = handle.join().expect("thread should complete");
        assert!(
            elapsed < Duration::from_millis(500),
            "unpark should interrupt the timeout, waited {elapsed:?}"
        );
    }

    #[test]
    fn parker_is_reusable() {
        let parker = Parker::new();
        for _ in 0..5 {
            parker.unpark();
            let start = Instant::now();
            parker.park();
            assert!(start.elapsed() < Duration::from_millis(50));
        }
    }

    #[test]
    fn no_lost_wakeup_under_racing_unpark() {
        for _ in 0..100 {
            let parker = Parker::new();
            let thread_parker = parker.clone();
            let handle = thread::spawn(move || thread_parker.park());
            thread::yield_now();
            parker.unpark();
            handle.join().expect("wakeup should not be lost");
        }
    }
}
