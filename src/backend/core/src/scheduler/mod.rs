//! Scheduler: translates DAG schedules into wall-clock triggers.
//!
//! On startup and every reconcile interval the scheduler re-reads active
//! DAGs and reconciles its in-memory trigger registry: cron and interval
//! schedules hold a timer task; manual and one-shot schedules install
//! none; disabled or deactivated DAGs have their timers cancelled. Every
//! firing re-reads the DAG to catch edits before delegating to the
//! dispatcher.
//!
//! No leader election: each server process runs its own copy, and
//! duplicate firings create distinct (observable, non-corrupting) runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::dag::{CronExpression, Schedule};
use crate::dispatch::Dispatcher;
use crate::store::StateStore;

struct TriggerEntry {
    /// Serialized schedule; a change respawns the timer
    fingerprint: String,
    handle: tokio::task::JoinHandle<()>,
}

pub struct RunScheduler {
    store: Arc<dyn StateStore>,
    dispatcher: Dispatcher,
    registry: Mutex<HashMap<Uuid, TriggerEntry>>,
}

impl RunScheduler {
    pub fn new(store: Arc<dyn StateStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Run the reconcile loop until the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        reconcile_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            if let Err(e) = self.reconcile_once().await {
                tracing::error!(error = %e, "Scheduler reconcile failed");
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(reconcile_interval) => {}
            }
        }
        self.cancel_all();
        tracing::info!("Scheduler stopped");
    }

    /// One reconcile pass over the trigger registry.
    pub async fn reconcile_once(&self) -> crate::error::Result<()> {
        let dags = self.store.list_active_dags().await?;

        let mut desired: HashMap<Uuid, String> = HashMap::new();
        for dag in &dags {
            if dag.schedule.enabled && dag.schedule.schedule.installs_timer() {
                let fingerprint =
                    serde_json::to_string(&dag.schedule).unwrap_or_default();
                desired.insert(dag.id, fingerprint);
            }
        }

        let mut registry = self.registry.lock();

        // Cancel timers whose DAG disappeared, was disabled, or changed.
        registry.retain(|dag_id, entry| {
            match desired.get(dag_id) {
                Some(fingerprint) if *fingerprint == entry.fingerprint => true,
                _ => {
                    entry.handle.abort();
                    tracing::debug!(dag_id = %dag_id, "Trigger cancelled");
                    false
                }
            }
        });

        // Install timers for new or changed schedules.
        for dag in dags {
            let Some(fingerprint) = desired.get(&dag.id) else { continue };
            if registry.contains_key(&dag.id) {
                continue;
            }

            let handle = match &dag.schedule.schedule {
                Schedule::Interval { seconds } => {
                    self.spawn_interval_timer(dag.id, *seconds)
                }
                Schedule::Cron { expression, timezone } => {
                    match CronExpression::parse(expression, timezone.as_deref()) {
                        Ok(cron) => self.spawn_cron_timer(dag.id, cron),
                        Err(e) => {
                            // The DAG stays valid; only its timer is skipped.
                            tracing::warn!(
                                dag_id = %dag.id,
                                error = %e,
                                "Invalid cron expression; schedule skipped"
                            );
                            continue;
                        }
                    }
                }
                _ => continue,
            };

            tracing::info!(
                dag_id = %dag.id,
                schedule = dag.schedule.schedule.as_str(),
                "Trigger installed"
            );
            registry.insert(
                dag.id,
                TriggerEntry {
                    fingerprint: fingerprint.clone(),
                    handle,
                },
            );
        }

        Ok(())
    }

    /// Number of installed timers (for tests and introspection).
    pub fn installed_triggers(&self) -> usize {
        self.registry.lock().len()
    }

    fn cancel_all(&self) {
        let mut registry = self.registry.lock();
        for (_, entry) in registry.drain() {
            entry.handle.abort();
        }
    }

    fn spawn_interval_timer(&self, dag_id: Uuid, seconds: u64) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(seconds.max(1));
            loop {
                tokio::time::sleep(period).await;
                fire(&*store, &dispatcher, dag_id).await;
            }
        })
    }

    fn spawn_cron_timer(&self, dag_id: Uuid, cron: CronExpression) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = cron.next_after(chrono::Utc::now()) else {
                    tracing::warn!(dag_id = %dag_id, "Cron schedule has no future firings");
                    break;
                };
                let wait = (next - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                fire(&*store, &dispatcher, dag_id).await;
            }
        })
    }
}

/// Re-read the DAG at fire time to catch edits, then create the run.
async fn fire(store: &dyn StateStore, dispatcher: &Dispatcher, dag_id: Uuid) {
    let now = chrono::Utc::now();
    let dag = match store.get_dag(dag_id).await {
        Ok(Some(dag)) => dag,
        Ok(None) => {
            tracing::warn!(dag_id = %dag_id, "Scheduled DAG no longer exists");
            return;
        }
        Err(e) => {
            tracing::error!(dag_id = %dag_id, error = %e, "Failed to re-read scheduled DAG");
            return;
        }
    };

    if !dag.may_trigger(now) {
        tracing::debug!(dag_id = %dag_id, "Schedule fired outside window; skipped");
        return;
    }

    match dispatcher.create_run(dag_id, "schedule").await {
        Ok(Some(run)) => {
            tracing::info!(dag_id = %dag_id, run_id = %run.id, "Scheduled run created")
        }
        Ok(None) => {}
        Err(e) => tracing::error!(dag_id = %dag_id, error = %e, "Scheduled trigger failed"),
    }
}
