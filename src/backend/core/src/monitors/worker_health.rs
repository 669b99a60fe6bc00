//! Worker health monitor.
//!
//! Declares workers offline once their heartbeat age exceeds the
//! timeout (default 15 s: three missed 5 s heartbeats). Draining
//! workers are spared so graceful shutdowns are not reported as
//! failures.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::store::StateStore;

pub struct WorkerHealthMonitor {
    store: Arc<dyn StateStore>,
    heartbeat_timeout: ChronoDuration,
}

impl WorkerHealthMonitor {
    pub fn new(store: Arc<dyn StateStore>, heartbeat_timeout_secs: i64) -> Self {
        Self {
            store,
            heartbeat_timeout: ChronoDuration::seconds(heartbeat_timeout_secs),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => tracing::warn!(count = n, "Workers marked offline"),
                Err(e) => tracing::error!(error = %e, "Worker health sweep failed"),
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Worker health monitor stopped");
    }

    /// One sweep; returns the number of workers reaped.
    pub async fn sweep_once(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.heartbeat_timeout;
        self.store.mark_workers_offline(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStateStore, WorkerRecord, WorkerStatus};

    #[tokio::test]
    async fn test_silent_worker_reaped_fresh_worker_kept() {
        let store = Arc::new(InMemoryStateStore::new());

        let mut silent = WorkerRecord::new("silent");
        silent.last_heartbeat = Utc::now() - ChronoDuration::seconds(60);
        store.upsert_worker(&silent).await.unwrap();

        let fresh = WorkerRecord::new("fresh");
        store.upsert_worker(&fresh).await.unwrap();

        let monitor = WorkerHealthMonitor::new(store.clone(), 15);
        assert_eq!(monitor.sweep_once().await.unwrap(), 1);

        let workers = store.list_workers().await.unwrap();
        let silent = workers.iter().find(|w| w.worker_id == "silent").unwrap();
        let fresh = workers.iter().find(|w| w.worker_id == "fresh").unwrap();
        assert_eq!(silent.status, WorkerStatus::Offline);
        assert_ne!(fresh.status, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut silent = WorkerRecord::new("silent");
        silent.last_heartbeat = Utc::now() - ChronoDuration::seconds(60);
        store.upsert_worker(&silent).await.unwrap();

        let monitor = WorkerHealthMonitor::new(store.clone(), 15);
        assert_eq!(monitor.sweep_once().await.unwrap(), 1);
        assert_eq!(monitor.sweep_once().await.unwrap(), 0);
    }
}
