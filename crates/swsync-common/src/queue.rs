//! Mutex-protected producer queue.
//!
//! Producers on other execution contexts only ever [`push`](BoundedQueue::push);
//! the dispatch loop takes items out in bounded batches and puts whatever it
//! did not get to back at the front, so ordering is preserved across
//! wakeups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue {name} is full ({capacity} entries)")]
    Full { name: &'static str, capacity: usize },

    #[error("queue {name} is closed")]
    Closed { name: &'static str },
}

/// FIFO queue with a fixed capacity that can be closed to producers.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    closed: AtomicBool,
    inner: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    /// `capacity == 0` means unbounded.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            closed: AtomicBool::new(false),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // a producer panicking mid-push cannot leave the deque inconsistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed { name: self.name });
        }
        let mut q = self.lock();
        if self.capacity > 0 && q.len() >= self.capacity {
            return Err(QueueError::Full {
                name: self.name,
                capacity: self.capacity,
            });
        }
        q.push_back(item);
        Ok(())
    }

    /// Takes at most `max` items from the front.
    pub fn take(&self, max: usize) -> Vec<T> {
        let mut q = self.lock();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    /// Takes everything, leaving the queue empty.
    pub fn take_all(&self) -> VecDeque<T> {
        std::mem::take(&mut *self.lock())
    }

    /// Puts `items` back at the front, keeping their order ahead of anything
    /// pushed in the meantime. Ignores capacity and the closed flag.
    pub fn requeue_front(&self, items: VecDeque<T>) {
        if items.is_empty() {
            return;
        }
        let mut q = self.lock();
        let newer = std::mem::replace(&mut *q, items);
        q.extend(newer);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Rejects further pushes until [`reopen`](Self::reopen).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_take_respects_budget() {
        let q = BoundedQueue::new("events", 0);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        assert_eq!(q.take(2), vec![0, 1]);
        assert_eq!(q.take(10), vec![2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let q = BoundedQueue::new("learn", 0);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        let mut all = q.take_all();
        let first = all.pop_front().unwrap();
        assert_eq!(first, 0);
        q.push(99).unwrap();
        q.requeue_front(all);
        assert_eq!(q.take(10), vec![1, 2, 3, 99]);
    }

    #[test]
    fn test_capacity_and_close() {
        let q = BoundedQueue::new("aging", 2);
        q.push('a').unwrap();
        q.push('b').unwrap();
        assert_eq!(q.push('c'), Err(QueueError::Full { name: "aging", capacity: 2 }));

        q.close();
        q.clear();
        assert_eq!(q.push('d'), Err(QueueError::Closed { name: "aging" }));
        q.reopen();
        assert!(q.push('d').is_ok());
    }

    #[test]
    fn test_concurrent_producers() {
        let q = Arc::new(BoundedQueue::new("events", 0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        q.push(t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 400);
    }
}
