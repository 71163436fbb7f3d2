//! Per-collection serialized task queue.

use std::future::Future;
use tokio::sync::Mutex;

/// FIFO queue running one task at a time.
///
/// Backed by a fair async mutex, so waiters run in arrival order. The
/// orchestrator keeps one queue per collection name; `force`-flagged
/// syncs bypass the queue entirely.
pub struct TaskQueue {
    slot: Mutex<()>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { slot: Mutex::new(()) }
    }

    /// Run a task once the queue slot is free.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.slot.lock().await;
        task.await
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run_serialized_in_fifo_order() {
        let queue = Arc::new(TaskQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..5 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                // Stagger arrival so lock acquisition order is stable
                tokio::time::sleep(Duration::from_millis(index as u64 * 10)).await;
                queue
                    .run(async {
                        assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        order.lock().unwrap().push(index);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_run_returns_task_output() {
        let queue = TaskQueue::new();
        let result = queue.run(async { 42 }).await;
        assert_eq!(result, 42);
    }
}
