//! Liveness refresh for stored rows.

use crate::store::NodeStore;
use crate::types::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Refresh `last_seen` on every stored row once per `interval`.
pub fn spawn_heartbeat(store: Arc<dyn NodeStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.touch_all(now_millis()) {
                Ok(rows) => debug!(rows, "Heartbeat refreshed rows"),
                Err(e) => error!("Heartbeat failed: {}", e),
            }
        }
    })
}
