//! Blocking bounded handoff queue connecting pipeline stages.
//!
//! `push` waits for room, `pop` waits for an item, and `drain` marks the end
//! of input: once a draining queue is empty every pop returns `None`.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    draining: bool,
    /// Largest length observed since construction.
    high_water: usize,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    /// Signalled when an item is added or the queue starts draining.
    not_empty: Condvar,
    /// Signalled when an item is removed or the queue starts draining.
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be non-zero");
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                draining: false,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Callers must not push after [`drain`](Self::drain).
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        state.high_water = state.high_water.max(state.items.len());
        drop(state);
        self.not_empty.notify_one();
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` only once the queue is draining and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.draining {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Mark the end of input and wake every waiter. Idempotent.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.draining = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Returns a guard that drains this queue when dropped.
    pub fn drain_on_drop(&self) -> DrainOnDrop<'_, T> {
        DrainOnDrop(self)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    pub fn high_water_mark(&self) -> usize {
        self.state.lock().high_water
    }
}

pub struct DrainOnDrop<'a, T>(&'a BoundedQueue<T>);

impl<T> Drop for DrainOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.drain();
    }
}
