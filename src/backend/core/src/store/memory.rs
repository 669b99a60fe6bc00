//! In-memory state store for tests and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::{DeferredEmail, DeferredEmailStatus, SmtpCredentials, StateStore, WorkerRecord, WorkerStatus};
use crate::dag::Dag;
use crate::error::Result;
use crate::run::{Run, RunStatus, TaskRecord, TaskRecordPatch, TaskStatus};

/// Process-local state store. Append and patch operations take the run
/// lock, mirroring the atomicity the Postgres backend gets from
/// per-statement writes.
#[derive(Default)]
pub struct InMemoryStateStore {
    dags: Mutex<HashMap<Uuid, Dag>>,
    runs: Mutex<HashMap<Uuid, Run>>,
    workers: Mutex<HashMap<String, WorkerRecord>>,
    deferred: Mutex<HashMap<Uuid, DeferredEmail>>,
    smtp: Mutex<HashMap<Uuid, SmtpCredentials>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(record: &mut TaskRecord, patch: TaskRecordPatch) {
    if let Some(status) = patch.status {
        record.status = status;
    }
    if patch.completed_at.is_some() {
        record.completed_at = patch.completed_at;
    }
    if patch.output.is_some() {
        record.output = patch.output;
    }
    if patch.error.is_some() {
        record.error = patch.error;
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    // ─── DAGs ────────────────────────────────────────────────────────────────

    async fn insert_dag(&self, dag: &Dag) -> Result<()> {
        self.dags.lock().insert(dag.id, dag.clone());
        Ok(())
    }

    async fn get_dag(&self, id: Uuid) -> Result<Option<Dag>> {
        Ok(self.dags.lock().get(&id).cloned())
    }

    async fn delete_dag(&self, id: Uuid) -> Result<bool> {
        Ok(self.dags.lock().remove(&id).is_some())
    }

    async fn list_active_dags(&self) -> Result<Vec<Dag>> {
        Ok(self
            .dags
            .lock()
            .values()
            .filter(|d| d.active)
            .cloned()
            .collect())
    }

    async fn find_dag_by_trigger_token(&self, token: &str) -> Result<Option<Dag>> {
        Ok(self
            .dags
            .lock()
            .values()
            .find(|d| {
                d.trigger
                    .as_ref()
                    .map(|t| t.token == token)
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn find_dag_by_trigger_path(&self, path: &str) -> Result<Option<Dag>> {
        Ok(self
            .dags
            .lock()
            .values()
            .find(|d| {
                d.trigger
                    .as_ref()
                    .and_then(|t| t.path.as_deref())
                    .map(|p| p == path)
                    .unwrap_or(false)
            })
            .cloned())
    }

    // ─── Runs ────────────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.runs.lock().insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.lock().get(&id).cloned())
    }

    async fn list_recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.runs.lock().values().cloned().collect();
        runs.sort_by(|a, b| b.timeline.queued_at.cmp(&a.timeline.queued_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn list_stale_runs(&self, queued_before: DateTime<Utc>) -> Result<Vec<Run>> {
        Ok(self
            .runs
            .lock()
            .values()
            .filter(|r| {
                matches!(r.status, RunStatus::Queued | RunStatus::Running)
                    && r.timeline.queued_at <= queued_before
            })
            .cloned()
            .collect())
    }

    async fn set_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut runs = self.runs.lock();
        if let Some(run) = runs.get_mut(&id) {
            run.status = status;
            if started_at.is_some() {
                run.timeline.started_at = started_at;
            }
            if completed_at.is_some() {
                run.timeline.completed_at = completed_at;
            }
        }
        Ok(())
    }

    async fn fail_run(&self, id: Uuid, reason: &str, completed_at: DateTime<Utc>) -> Result<()> {
        let mut runs = self.runs.lock();
        if let Some(run) = runs.get_mut(&id) {
            run.status = RunStatus::Failed;
            run.failure_reason = Some(reason.to_string());
            run.timeline.completed_at = Some(completed_at);
        }
        Ok(())
    }

    async fn append_task_record(&self, run_id: Uuid, record: &TaskRecord) -> Result<()> {
        let mut runs = self.runs.lock();
        if let Some(run) = runs.get_mut(&run_id) {
            run.task_records.push(record.clone());
        }
        Ok(())
    }

    async fn update_task_record(
        &self,
        run_id: Uuid,
        node_id: &str,
        patch: TaskRecordPatch,
    ) -> Result<bool> {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(false);
        };
        let Some(record) = run
            .task_records
            .iter_mut()
            .rev()
            .find(|r| r.node_id.as_str() == node_id)
        else {
            return Ok(false);
        };
        apply_patch(record, patch);
        Ok(true)
    }

    async fn fail_open_records(&self, run_id: Uuid, error: &str) -> Result<u64> {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(0);
        };
        let mut changed = 0;
        for record in &mut run.task_records {
            if !record.status.is_terminal() {
                record.status = TaskStatus::Failed;
                record.error = Some(error.to_string());
                record.completed_at = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }

    // ─── Workers ─────────────────────────────────────────────────────────────

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        self.workers
            .lock()
            .insert(worker.worker_id.clone(), worker.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        Ok(self.workers.lock().values().cloned().collect())
    }

    async fn mark_workers_offline(&self, heartbeat_before: DateTime<Utc>) -> Result<u64> {
        let mut workers = self.workers.lock();
        let mut reaped = 0;
        for worker in workers.values_mut() {
            if worker.last_heartbeat < heartbeat_before
                && worker.status != WorkerStatus::Offline
                && worker.status != WorkerStatus::Draining
            {
                worker.status = WorkerStatus::Offline;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    // ─── Deferred emails ─────────────────────────────────────────────────────

    async fn insert_deferred_email(&self, email: &DeferredEmail) -> Result<()> {
        self.deferred.lock().insert(email.id, email.clone());
        Ok(())
    }

    async fn due_deferred_emails(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeferredEmail>> {
        let mut due: Vec<DeferredEmail> = self
            .deferred
            .lock()
            .values()
            .filter(|e| {
                e.status == DeferredEmailStatus::Pending && e.fire_at >= from && e.fire_at <= to
            })
            .cloned()
            .collect();
        due.sort_by_key(|e| e.fire_at);
        Ok(due)
    }

    async fn claim_deferred_email(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool> {
        let mut deferred = self.deferred.lock();
        match deferred.get_mut(&id) {
            Some(email) if email.status == DeferredEmailStatus::Pending => {
                email.status = DeferredEmailStatus::Sent;
                email.sent_at = Some(sent_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_deferred_email(&self, id: Uuid, error: &str) -> Result<()> {
        let mut deferred = self.deferred.lock();
        if let Some(email) = deferred.get_mut(&id) {
            email.status = DeferredEmailStatus::Failed;
            email.sent_at = None;
            email.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn pending_deferred_for_run(&self, run_id: Uuid) -> Result<Vec<DeferredEmail>> {
        Ok(self
            .deferred
            .lock()
            .values()
            .filter(|e| e.run_id == run_id && e.status == DeferredEmailStatus::Pending)
            .cloned()
            .collect())
    }

    async fn cancel_pending_deferred_for_run(&self, run_id: Uuid) -> Result<u64> {
        let mut deferred = self.deferred.lock();
        let mut cancelled = 0;
        for email in deferred.values_mut() {
            if email.run_id == run_id && email.status == DeferredEmailStatus::Pending {
                email.status = DeferredEmailStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    // ─── SMTP credentials ────────────────────────────────────────────────────

    async fn get_smtp_credentials(&self, user_id: Uuid) -> Result<Option<SmtpCredentials>> {
        Ok(self.smtp.lock().get(&user_id).cloned())
    }

    async fn upsert_smtp_credentials(&self, credentials: &SmtpCredentials) -> Result<()> {
        self.smtp
            .lock()
            .insert(credentials.user_id, credentials.clone());
        Ok(())
    }

    // ─── Health ──────────────────────────────────────────────────────────────

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::NodeId;

    #[tokio::test]
    async fn test_append_and_patch_latest() {
        let store = InMemoryStateStore::new();
        let run = Run::new(Uuid::new_v4(), Uuid::new_v4(), "manual");
        let run_id = run.id;
        store.insert_run(&run).await.unwrap();

        store
            .append_task_record(run_id, &TaskRecord::running(NodeId::new("a"), "a", 1))
            .await
            .unwrap();
        store
            .append_task_record(run_id, &TaskRecord::running(NodeId::new("a"), "a", 2))
            .await
            .unwrap();

        let changed = store
            .update_task_record(run_id, "a", TaskRecordPatch::success(serde_json::json!(1)))
            .await
            .unwrap();
        assert!(changed);

        let run = store.get_run(run_id).await.unwrap().unwrap();
        // Only the latest attempt is patched.
        assert_eq!(run.task_records[0].status, TaskStatus::Running);
        assert_eq!(run.task_records[1].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_claim_deferred_is_single_winner() {
        let store = InMemoryStateStore::new();
        let email = DeferredEmail::new(
            Uuid::new_v4(),
            "n",
            Uuid::new_v4(),
            "a@b.c",
            "s",
            "b",
            Utc::now(),
        );
        store.insert_deferred_email(&email).await.unwrap();

        assert!(store.claim_deferred_email(email.id, Utc::now()).await.unwrap());
        assert!(!store.claim_deferred_email(email.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_draining_workers_not_reaped() {
        let store = InMemoryStateStore::new();
        let mut stale = WorkerRecord::new("w1");
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        store.upsert_worker(&stale).await.unwrap();

        let mut draining = WorkerRecord::new("w2");
        draining.status = WorkerStatus::Draining;
        draining.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        store.upsert_worker(&draining).await.unwrap();

        let reaped = store
            .mark_workers_offline(Utc::now() - chrono::Duration::seconds(15))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let workers = store.list_workers().await.unwrap();
        let w1 = workers.iter().find(|w| w.worker_id == "w1").unwrap();
        let w2 = workers.iter().find(|w| w.worker_id == "w2").unwrap();
        assert_eq!(w1.status, WorkerStatus::Offline);
        assert_eq!(w2.status, WorkerStatus::Draining);
    }
}
