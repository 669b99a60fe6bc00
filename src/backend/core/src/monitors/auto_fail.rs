//! Auto-fail monitor for stuck runs.
//!
//! A run whose wall-clock lifetime exceeds the effective cutoff is
//! terminated: every non-terminal task record is failed with
//! `auto_failed_timeout` and the run is marked failed. Pending deferred
//! emails extend the cutoff past their latest fire time plus a grace
//! period, so legitimately-waiting runs are not reaped.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::events::{EventSink, ExecutionEvent};
use crate::run::Run;
use crate::store::{DeferredEmail, StateStore};

pub const AUTO_FAIL_REASON: &str = "auto_failed_timeout";

pub struct AutoFailMonitor {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
    max_age: ChronoDuration,
    grace: ChronoDuration,
}

impl AutoFailMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventSink>,
        max_age_minutes: i64,
        grace_minutes: i64,
    ) -> Self {
        Self {
            store,
            events,
            max_age: ChronoDuration::minutes(max_age_minutes),
            grace: ChronoDuration::minutes(grace_minutes),
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
                Ok(n) => tracing::warn!(count = n, "Runs auto-failed"),
                Err(e) => tracing::error!(error = %e, "Auto-fail sweep failed"),
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
        tracing::info!("Auto-fail monitor stopped");
    }

    /// One sweep; returns the number of runs terminated.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = Utc::now();
        let stale = self.store.list_stale_runs(now - self.max_age).await?;

        let mut failed = 0;
        for run in stale {
            let pending = self.store.pending_deferred_for_run(run.id).await?;
            let cutoff = self.effective_cutoff(&run, &pending);
            if now < cutoff {
                continue;
            }

            self.store
                .fail_open_records(run.id, AUTO_FAIL_REASON)
                .await?;
            self.store.cancel_pending_deferred_for_run(run.id).await?;
            self.store.fail_run(run.id, AUTO_FAIL_REASON, now).await?;
            failed += 1;

            tracing::warn!(
                run_id = %run.id,
                queued_at = %run.timeline.queued_at,
                "Run auto-failed after exceeding its cutoff"
            );
            if let Some(updated) = self.store.get_run(run.id).await? {
                self.events.emit(ExecutionEvent::run_update(&updated)).await;
            }
        }
        Ok(failed)
    }

    /// Default cutoff is `queued_at + max_age`; pending deferred emails
    /// extend it to their latest fire time plus the grace period.
    fn effective_cutoff(&self, run: &Run, pending: &[DeferredEmail]) -> DateTime<Utc> {
        let base = run.timeline.queued_at + self.max_age;
        match pending.iter().map(|e| e.fire_at).max() {
            Some(latest_fire) => base.max(latest_fire + self.grace),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::NodeId;
    use crate::events::BroadcastEventBus;
    use crate::run::{RunStatus, TaskRecord, TaskStatus};
    use crate::store::InMemoryStateStore;
    use uuid::Uuid;

    fn monitor(store: Arc<InMemoryStateStore>) -> AutoFailMonitor {
        AutoFailMonitor::new(store, Arc::new(BroadcastEventBus::default()), 60, 10)
    }

    async fn stale_run(store: &InMemoryStateStore, age_minutes: i64) -> Run {
        let mut run = Run::new(Uuid::new_v4(), Uuid::new_v4(), "manual");
        run.status = RunStatus::Running;
        run.timeline.queued_at = Utc::now() - ChronoDuration::minutes(age_minutes);
        store.insert_run(&run).await.unwrap();

        let mut record = TaskRecord::running(NodeId::new("a"), "a", 1);
        record.status = TaskStatus::Running;
        store.append_task_record(run.id, &record).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_stale_run_auto_failed() {
        let store = Arc::new(InMemoryStateStore::new());
        let run = stale_run(&store, 120).await;

        let failed = monitor(store.clone()).sweep_once().await.unwrap();
        assert_eq!(failed, 1);

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some(AUTO_FAIL_REASON));
        assert!(run.timeline.completed_at.is_some());
        assert_eq!(run.task_records[0].status, TaskStatus::Failed);
        assert_eq!(
            run.task_records[0].error.as_deref(),
            Some(AUTO_FAIL_REASON)
        );
    }

    #[tokio::test]
    async fn test_young_run_untouched() {
        let store = Arc::new(InMemoryStateStore::new());
        let run = stale_run(&store, 10).await;

        let failed = monitor(store.clone()).sweep_once().await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_pending_deferred_extends_cutoff() {
        let store = Arc::new(InMemoryStateStore::new());
        let run = stale_run(&store, 120).await;

        // A deferred email firing in the future keeps the run alive.
        let email = DeferredEmail::new(
            run.id,
            "a",
            run.owner,
            "ops@example.com",
            "later",
            "body",
            Utc::now() + ChronoDuration::minutes(30),
        );
        store.insert_deferred_email(&email).await.unwrap();

        let failed = monitor(store.clone()).sweep_once().await.unwrap();
        assert_eq!(failed, 0);
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_expired_deferred_grace_allows_reap() {
        let store = Arc::new(InMemoryStateStore::new());
        let run = stale_run(&store, 120).await;

        // Fire time and grace both long past: the run is reaped.
        let email = DeferredEmail::new(
            run.id,
            "a",
            run.owner,
            "ops@example.com",
            "old",
            "body",
            Utc::now() - ChronoDuration::minutes(45),
        );
        store.insert_deferred_email(&email).await.unwrap();

        let failed = monitor(store.clone()).sweep_once().await.unwrap();
        assert_eq!(failed, 1);

        // No pending deferred email may reference a terminal run.
        let pending = store.pending_deferred_for_run(run.id).await.unwrap();
        assert!(pending.is_empty());
    }
}
