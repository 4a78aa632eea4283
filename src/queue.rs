//! Thread-safe FIFO handing commands from callers to the dispatcher worker.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Blocking FIFO queue with timed dequeue.
///
/// ```
/// use std::time::Duration;
/// use rs_trainz_bridge::queue::CommandQueue;
///
/// let q = CommandQueue::new();
/// q.push(1);
/// q.push(2);
/// assert_eq!(q.pop_timeout(Duration::ZERO), Some(1));
/// assert_eq!(q.pop_timeout(Duration::ZERO), Some(2));
/// assert_eq!(q.pop_timeout(Duration::from_millis(5)), None);
/// ```
pub struct CommandQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommandQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Append at the back.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Put an item back at the front (it keeps its place in line).
    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.available.notify_one();
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() && !timeout.is_zero() {
            // spurious wakeups just end the wait early; the caller loops
            let _ = self.available.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    /// Wake a blocked [`pop_timeout`](Self::pop_timeout) without adding an item.
    pub fn wake(&self) {
        self.available.notify_all();
    }

    /// Remove everything; returns the removed items in order.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
