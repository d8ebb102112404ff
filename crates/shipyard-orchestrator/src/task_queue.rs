use crate::types::Task;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry. Ordered by priority (higher first), then by enqueue sequence
/// (earlier first), so equal-priority tasks leave in FIFO order.
struct QueuedTask {
    priority: i32,
    sequence: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the greatest entry pops first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Inner {
    heap: BinaryHeap<QueuedTask>,
    next_sequence: u64,
}

/// Lock-protected priority queue shared by the orchestrator and all workers.
///
/// Every operation takes the lock once, so push and pop are atomic with
/// respect to concurrent workers.
pub struct TaskQueue {
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
        }
    }

    /// Add a task. Its position is fixed by its priority and this call's order.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(QueuedTask {
            priority: task.priority,
            sequence,
            task,
        });
    }

    /// Remove and return the most urgent task, or `None` when empty.
    pub fn pop(&self) -> Option<Task> {
        self.inner.lock().heap.pop().map(|entry| entry.task)
    }

    /// Clone of the most urgent task without removing it.
    pub fn peek(&self) -> Option<Task> {
        self.inner.lock().heap.peek().map(|entry| entry.task.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(description: &str, priority: i32) -> Task {
        Task::new("test", description).with_priority(priority)
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_priority_order() {
        let queue = TaskQueue::new();
        queue.push(task("T1", 1));
        queue.push(task("T2", 10));
        queue.push(task("T3", 5));

        assert_eq!(queue.pop().unwrap().description, "T2");
        assert_eq!(queue.pop().unwrap().description, "T3");
        assert_eq!(queue.pop().unwrap().description, "T1");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let queue = TaskQueue::new();
        for i in 0..20 {
            queue.push(task(&format!("t{i}"), 3));
        }
        for i in 0..20 {
            assert_eq!(queue.pop().unwrap().description, format!("t{i}"));
        }
    }

    #[test]
    fn test_fifo_follows_enqueue_order_not_creation_order() {
        let queue = TaskQueue::new();
        let older = task("older", 2);
        let newer = task("newer", 2);
        queue.push(newer);
        queue.push(older);
        assert_eq!(queue.pop().unwrap().description, "newer");
    }

    #[test]
    fn test_negative_priorities() {
        let queue = TaskQueue::new();
        queue.push(task("low", -5));
        queue.push(task("zero", 0));
        assert_eq!(queue.pop().unwrap().description, "zero");
        assert_eq!(queue.pop().unwrap().description, "low");
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = TaskQueue::new();
        queue.push(task("only", 1));
        assert_eq!(queue.peek().unwrap().description, "only");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_concurrent_pop_yields_each_task_once() {
        let queue = Arc::new(TaskQueue::new());
        for i in 0..200 {
            queue.push(task(&format!("t{i}"), i % 7));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(t) = queue.pop() {
                        taken.push(t.id);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 200);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
