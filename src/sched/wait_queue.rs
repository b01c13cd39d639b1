//! Wait queue: threads blocked on one synchronization object.
//!
//! Ordering policy: by priority, FIFO among equal priorities. A wake
//! therefore always releases the most urgent longest-waiting thread.

use crate::thread::{QueueLocation, Thread};
use alloc::collections::VecDeque;

/// Ordered collection of WAITING threads.
pub struct WaitQueue {
    waiters: VecDeque<Thread>,
}

impl WaitQueue {
    /// Create an empty wait queue.
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Number of waiting threads.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no thread is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Insert a waiter in priority order, after existing equal-priority
    /// waiters.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already a member of any queue.
    pub fn insert(&mut self, thread: Thread) {
        thread.mark_enqueued(QueueLocation::WaitQueue);
        let prio = thread.priority().raw();
        let pos = self
            .waiters
            .iter()
            .position(|t| t.priority().raw() > prio)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, thread);
    }

    /// Remove and return the best waiter.
    pub fn pop_front(&mut self) -> Option<Thread> {
        let thread = self.waiters.pop_front()?;
        thread.mark_dequeued();
        Some(thread)
    }

    /// Best waiter without removal.
    pub fn peek(&self) -> Option<&Thread> {
        self.waiters.front()
    }

    /// Remove a specific waiter. Returns whether it was present.
    pub fn remove(&mut self, thread: &Thread) -> bool {
        if let Some(pos) = self.waiters.iter().position(|t| t == thread) {
            self.waiters.remove(pos);
            thread.mark_dequeued();
            true
        } else {
            false
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: u64, prio: i8) -> Thread {
        Thread::test_thread(id, prio)
    }

    #[test]
    fn priority_order_with_fifo_ties() {
        let mut q = WaitQueue::new();
        q.insert(thread(1, 5));
        q.insert(thread(2, 5));
        q.insert(thread(3, -1));
        q.insert(thread(4, 5));
        q.insert(thread(5, 10));

        let order: alloc::vec::Vec<u64> = core::iter::from_fn(|| q.pop_front())
            .map(|t| t.id().raw())
            .collect();
        assert_eq!(order, [3, 1, 2, 4, 5]);
    }

    #[test]
    fn remove_specific_waiter() {
        let mut q = WaitQueue::new();
        let target = thread(2, 5);
        q.insert(thread(1, 5));
        q.insert(target.clone());
        assert!(q.remove(&target));
        assert!(!q.remove(&target));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_front().unwrap().id().raw(), 1);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = WaitQueue::new();
        q.insert(thread(1, 3));
        assert_eq!(q.peek().unwrap().id().raw(), 1);
        assert_eq!(q.len(), 1);
    }
}
