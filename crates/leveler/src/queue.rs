//! Bounded priority queue of pending tasks
//!
//! Orders by priority (highest first), then by arrival (oldest first).

use crate::task::Task;
use keel_core_resilience::ResilienceError;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

struct Entry<P> {
    priority: i32,
    seq: Reverse<u64>,
    task: Task<P>,
}

impl<P> Entry<P> {
    fn key(&self) -> (i32, Reverse<u64>) {
        (self.priority, self.seq)
    }
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<P> Eq for Entry<P> {}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Entry<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending tasks, bounded at admission
pub struct TaskQueue<P> {
    heap: BinaryHeap<Entry<P>>,
    max_size: usize,
    next_seq: u64,
}

impl<P> TaskQueue<P> {
    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_size,
            next_seq: 0,
        }
    }

    /// Admit a new task, failing with `QueueFull` at capacity
    ///
    /// The queue is unchanged on failure.
    pub fn push(&mut self, task: Task<P>) -> Result<(), ResilienceError> {
        if self.heap.len() >= self.max_size {
            return Err(ResilienceError::QueueFull {
                capacity: self.max_size,
            });
        }
        self.insert(task);
        Ok(())
    }

    /// Put back a task that was already admitted; ignores the bound
    pub fn requeue(&mut self, task: Task<P>) {
        self.insert(task);
    }

    fn insert(&mut self, task: Task<P>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority: task.priority,
            seq: Reverse(seq),
            task,
        });
    }

    /// Remove the highest-priority, oldest task
    pub fn pop(&mut self) -> Option<Task<P>> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn peek(&self) -> Option<&Task<P>> {
        self.heap.peek().map(|entry| &entry.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    fn task(id: u64, priority: i32) -> Task<&'static str> {
        Task::new(TaskId(id), "payload", priority)
    }

    #[test]
    fn test_priority_then_arrival_order() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(1, 0)).unwrap();
        queue.push(task(2, 5)).unwrap();
        queue.push(task(3, 0)).unwrap();
        queue.push(task(4, 5)).unwrap();
        queue.push(task(5, -1)).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|t| t.id.0).collect();
        assert_eq!(order, vec![2, 4, 1, 3, 5]);
    }

    #[test]
    fn test_full_queue_rejects_and_keeps_size() {
        let mut queue = TaskQueue::new(2);
        queue.push(task(1, 0)).unwrap();
        queue.push(task(2, 0)).unwrap();

        let err = queue.push(task(3, 9)).unwrap_err();
        assert!(matches!(err, ResilienceError::QueueFull { capacity: 2 }));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().map(|t| t.id), Some(TaskId(1)));
    }

    #[test]
    fn test_requeue_bypasses_bound() {
        let mut queue = TaskQueue::new(1);
        queue.push(task(1, 0)).unwrap();
        queue.requeue(task(2, 0));

        assert_eq!(queue.len(), 2);
        assert!(queue.push(task(3, 0)).is_err());
    }

    #[test]
    fn test_requeued_task_goes_behind_equal_priority() {
        let mut queue = TaskQueue::new(10);
        queue.push(task(1, 0)).unwrap();
        let first = queue.pop().unwrap();
        queue.push(task(2, 0)).unwrap();
        queue.requeue(first);

        assert_eq!(queue.pop().map(|t| t.id), Some(TaskId(2)));
        assert_eq!(queue.pop().map(|t| t.id), Some(TaskId(1)));
        assert!(queue.is_empty());
    }
}
