//! Blocking priority queue feeding the pipeline worker
//!
//! Larger priority values are served first; equal priorities are served in
//! submission order. Closing the queue wakes every blocked consumer and makes
//! `pop` return `None`, which is how the worker learns to shut down.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue without blocking; returns false once the queue is closed
    pub fn push(&self, item: T, priority: i32) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            item,
        });
        drop(state);
        self.available.notify_one();
        true
    }

    /// Block until an item is available; `None` after `close`
    pub fn pop(&self) -> Option<T> {
        self.pop_with(|_| {})
    }

    /// Like [`pop`](Self::pop), running `on_take` before the queue lock is released
    ///
    /// Lets the consumer record the item as taken with no gap in which it is
    /// neither queued nor recorded. `on_take` must not touch this queue.
    pub fn pop_with<F: FnOnce(&T)>(&self, on_take: F) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(entry) = state.heap.pop() {
                on_take(&entry.item);
                return Some(entry.item);
            }
            self.available.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.heap.pop().map(|entry| entry.item)
    }

    /// Discard every queued item, returning how many were dropped
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.heap.len();
        state.heap.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further pushes and release blocked consumers; pending items are dropped
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.heap.clear();
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_higher_priority_first() {
        let queue = TaskQueue::new();
        queue.push("low", 0);
        queue.push("high", 10);
        queue.push("mid", 5);
        assert_eq!(queue.try_pop(), Some("high"));
        assert_eq!(queue.try_pop(), Some("mid"));
        assert_eq!(queue.try_pop(), Some("low"));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_fifo_on_equal_priority() {
        let queue = TaskQueue::new();
        for i in 0..20 {
            queue.push(i, 3);
        }
        queue.push(100, i32::MAX);
        queue.push(-1, i32::MIN);
        assert_eq!(queue.try_pop(), Some(100));
        for i in 0..20 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), Some(-1));
    }

    #[test]
    fn test_drain_empties_queue() {
        let queue = TaskQueue::new();
        for i in 0..5 {
            queue.push(i, i);
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.drain(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn test_close_releases_blocked_consumer() {
        let queue = Arc::new(TaskQueue::<u32>::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert!(!queue.push(1, 0));
        assert!(queue.is_closed());
    }

    #[test]
    fn test_pop_with_runs_hook_on_taken_item() {
        let queue = TaskQueue::new();
        queue.push("low", 0);
        queue.push("high", 1);
        let mut seen = None;
        assert_eq!(queue.pop_with(|item| seen = Some(*item)), Some("high"));
        assert_eq!(seen, Some("high"));

        queue.close();
        let mut called = false;
        assert_eq!(queue.pop_with(|_| called = true), None);
        assert!(!called);
    }

    #[test]
    fn test_blocking_pop_receives_later_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.push(7u32, 0));
        assert_eq!(consumer.join().unwrap(), Some(7));
    }
}
