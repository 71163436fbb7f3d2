//! Trailing-edge debounce for push triggering.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Trailing-edge debouncer.
///
/// Each call schedules the task `wait` later, superseding any pending
/// not-yet-fired call. The orchestrator keeps one per collection name,
/// so bursts of local writes within the window coalesce into a single
/// push without debouncing collections against each other.
pub struct Debouncer {
    wait: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Create a debouncer with the given trailing window.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `task` to run after the window, superseding a pending
    /// invocation.
    pub fn call<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let wait = self.wait;
        let handle = tokio::spawn(async move {
            sleep(wait).await;
            task.await;
        });
        if let Some(previous) = self.pending.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Drop any pending invocation without running it.
    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().unwrap().take() {
            pending.abort();
        }
    }
}
