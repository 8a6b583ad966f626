//! Timeout/Retry Escalator.
//!
//! Each in-flight confirmation arms one timer keyed by `(join_id, level)`.
//! On expiry the policy decides between re-sending the same level
//! (`retry_count < max_retries`) and escalating to the parent level with a
//! fresh retry count. Cancellation is idempotent, and a timer whose entry
//! was cancelled or replaced never runs its expiry action: when a
//! confirmation and an expiry race, the confirmation wins.

use crate::types::{JoinId, TierLevel};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Default confirmation timeout.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of same-level retries before escalating.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Confirmation timeout and retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub confirmation_timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// What to do when the confirmation for `level` timed out after
    /// `retry_count` same-level retries.
    pub fn decide(&self, level: TierLevel, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            return RetryDecision::RetryCurrentLevel {
                attempt: retry_count + 1,
            };
        }
        match level.parent() {
            Some(upper) => RetryDecision::RetryUpperLevel { upper },
            None => RetryDecision::Exhausted,
        }
    }
}

/// Outcome of a confirmation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-send the same level's registration to the same peer.
    RetryCurrentLevel { attempt: u32 },
    /// Ask the parent level's main node for a fresh allocation.
    RetryUpperLevel { upper: TierLevel },
    /// Retries exhausted at the domain level; nothing above to ask.
    Exhausted,
}

/// Key of one armed timer.
pub type TimerKey = (JoinId, TierLevel);

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Table of armed confirmation timers, safe for concurrent arm/cancel.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationTimers {
    entries: Arc<Mutex<HashMap<TimerKey, TimerEntry>>>,
    generation: Arc<AtomicU64>,
}

impl ConfirmationTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `key`. After `timeout`, `on_expire` runs unless the
    /// timer was cancelled or re-armed in the meantime. Re-arming replaces
    /// any timer already armed for the key.
    pub fn start<F>(&self, key: TimerKey, timeout: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entries = Arc::clone(&self.entries);
        let task_key = key.clone();

        // Hold the table lock across spawn + insert so the task cannot
        // observe the table before its own entry is present.
        let mut table = match self.entries.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let fired = {
                let mut table = match entries.lock() {
                    Ok(table) => table,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match table.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        table.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if fired {
                trace!(join_id = %task_key.0, level = %task_key.1, "Confirmation timer fired");
                on_expire.await;
            }
        });
        if let Some(previous) = table.insert(key, TimerEntry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Disarm the timer for `key`. Returns false if none was armed, which
    /// is not an error.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        let removed = match self.entries.lock() {
            Ok(mut table) => table.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
        match removed {
            Some(entry) => {
                entry.handle.abort();
                trace!(join_id = %key.0, level = %key.1, "Confirmation timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Disarm every timer belonging to `join_id`.
    pub fn cancel_join(&self, join_id: &JoinId) -> usize {
        TierLevel::ALL
            .iter()
            .filter(|level| self.cancel(&(join_id.clone(), **level)))
            .count()
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        match self.entries.lock() {
            Ok(table) => table.contains_key(key),
            Err(poisoned) => poisoned.into_inner().contains_key(key),
        }
    }

    pub fn armed_count(&self) -> usize {
        match self.entries.lock() {
            Ok(table) => table.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
