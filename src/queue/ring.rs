//! Bounded MPMC ring queue.

use crossbeam_queue::ArrayQueue;

/// A bounded multi-producer multi-consumer FIFO queue with fixed
/// capacity.
///
/// [`push`](Self::push) fails when the queue is full;
/// [`push_until_success`](Self::push_until_success) instead evicts the
/// oldest element to make room, so the queue keeps the most recent
/// `capacity` values.
#[derive(Debug)]
pub struct RingQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> RingQueue<T> {
    /// Creates a queue holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring queue capacity must be non-zero");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Appends a value to the back of the queue.
    ///
    /// Returns false (leaving the queue unchanged) when full.
    pub fn push(&self, value: T) -> bool {
        self.inner.push(value).is_ok()
    }

    /// Appends a value, evicting the oldest element if the queue is
    /// full. Returns the evicted element, if any.
    pub fn push_until_success(&self, value: T) -> Option<T> {
        self.inner.force_push(value)
    }

    /// Removes the value at the front of the queue.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Returns the fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Returns the number of queued values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the queue holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }
}
