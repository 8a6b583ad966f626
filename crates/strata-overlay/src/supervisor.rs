//! Supervised background tasks for fire-and-forget work.
//!
//! Confirmations, `addNewNode` fan-out and next-level dispatch never block
//! the caller's own response. Their failures are logged and counted here
//! instead of being dropped with an unawaited future.

use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{trace, warn};

/// Tracks in-flight background tasks.
#[derive(Debug, Clone)]
pub struct TaskSupervisor {
    in_flight: Arc<watch::Sender<usize>>,
    failures: Arc<AtomicU64>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            in_flight: Arc::new(in_flight),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `task` in the background. An `Err` is logged with `label`.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.in_flight.send_modify(|n| *n += 1);
        let in_flight = Arc::clone(&self.in_flight);
        let failures = Arc::clone(&self.failures);
        tokio::spawn(async move {
            match task.await {
                Ok(()) => trace!(task = label, "Background task finished"),
                Err(e) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(task = label, error = %e, "Background task failed");
                }
            }
            in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Number of tasks still running.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Number of tasks that finished with an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait until no background task is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
