//! Deferred email handler.
//!
//! Sweeps due deferred emails every minute. Each row is claimed with a
//! compare-and-set on `pending` so exactly one process sends even when
//! several servers sweep concurrently. A completed send flips the owning
//! task record from `scheduled` to `success`, enqueues the node's
//! dependents, and re-evaluates run completion — the deferred send is
//! what finally lets the run terminate.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::events::{EventSink, ExecutionEvent};
use crate::executors::{resolve_account, Mailer, OutgoingEmail};
use crate::run::{reconcile_run, TaskRecord, TaskRecordPatch, TaskStatus};
use crate::store::{DeferredEmail, StateStore};

/// How far back a sweep looks for due rows.
const SWEEP_LOOKBACK_SECS: i64 = 60;

pub struct DeferredEmailHandler {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
    dispatcher: Dispatcher,
    mailer: Arc<dyn Mailer>,
    encryption_key: Option<[u8; 32]>,
}

impl DeferredEmailHandler {
    pub fn new(
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventSink>,
        dispatcher: Dispatcher,
        mailer: Arc<dyn Mailer>,
        encryption_key: Option<[u8; 32]>,
    ) -> Self {
        Self {
            store,
            events,
            dispatcher,
            mailer,
            encryption_key,
        }
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "Deferred emails processed"),
                Err(e) => tracing::error!(error = %e, "Deferred email sweep failed"),
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
        tracing::info!("Deferred email handler stopped");
    }

    /// One sweep over the due window. Returns how many rows this process
    /// claimed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self
            .store
            .due_deferred_emails(now - ChronoDuration::seconds(SWEEP_LOOKBACK_SECS), now)
            .await?;

        let mut processed = 0;
        for email in due {
            // Single-winner gate across server processes.
            if !self.store.claim_deferred_email(email.id, now).await? {
                continue;
            }
            processed += 1;
            self.send_claimed(&email).await?;
        }
        Ok(processed)
    }

    async fn send_claimed(&self, email: &DeferredEmail) -> Result<()> {
        let send_result = async {
            let (account, from_address) = resolve_account(
                self.store.as_ref(),
                self.encryption_key.as_ref(),
                Some(email.sender_user_id),
            )
            .await?;
            self.mailer
                .send(
                    &account,
                    &OutgoingEmail {
                        from: from_address,
                        to: email.recipient.clone(),
                        subject: email.subject.clone(),
                        body: email.body.clone(),
                    },
                )
                .await
        }
        .await;

        match send_result {
            Ok(message_id) => {
                tracing::info!(
                    deferred_id = %email.id,
                    run_id = %email.run_id,
                    "Deferred email sent"
                );
                self.reconcile_owner(email, Ok(message_id)).await
            }
            Err(e) => {
                tracing::warn!(
                    deferred_id = %email.id,
                    run_id = %email.run_id,
                    error = %e,
                    "Deferred email send failed"
                );
                self.store
                    .fail_deferred_email(email.id, e.user_message())
                    .await?;
                self.reconcile_owner(email, Err(e.user_message().to_string()))
                    .await
            }
        }
    }

    /// Flip the owning `scheduled` record, enqueue dependents on success,
    /// and re-evaluate run completion.
    async fn reconcile_owner(
        &self,
        email: &DeferredEmail,
        outcome: std::result::Result<String, String>,
    ) -> Result<()> {
        let Some(run) = self.store.get_run(email.run_id).await? else {
            tracing::warn!(run_id = %email.run_id, "Deferred email's run no longer exists");
            return Ok(());
        };

        let node_id = crate::dag::NodeId::new(email.node_id.clone());
        let still_scheduled = matches!(
            run.latest_record(&node_id).map(|r| r.status),
            Some(TaskStatus::Scheduled)
        );

        let attempt = run
            .latest_record(&node_id)
            .map(|r| r.attempts)
            .unwrap_or(1);
        let display_name = run
            .latest_record(&node_id)
            .map(|r| r.display_name.clone())
            .unwrap_or_else(|| email.node_id.clone());

        if still_scheduled {
            let patch = match &outcome {
                Ok(message_id) => {
                    TaskRecordPatch::success(serde_json::json!({ "messageId": message_id }))
                }
                Err(error) => TaskRecordPatch::failed(error.clone()),
            };
            self.store
                .update_task_record(email.run_id, &email.node_id, patch)
                .await?;

            let mut record = TaskRecord::running(node_id.clone(), display_name, attempt);
            match &outcome {
                Ok(message_id) => {
                    record.status = TaskStatus::Success;
                    record.output = Some(serde_json::json!({ "messageId": message_id }));
                }
                Err(error) => {
                    record.status = TaskStatus::Failed;
                    record.error = Some(error.clone());
                }
            }
            record.completed_at = Some(Utc::now());
            self.events
                .emit(ExecutionEvent::task_update(email.run_id, &record))
                .await;
        }

        let Some(dag) = self.store.get_dag(run.dag_id).await? else {
            // The DAG was deleted mid-run; the auto-fail monitor will
            // eventually close the run.
            tracing::warn!(run_id = %run.id, "Deferred email's DAG no longer exists");
            return Ok(());
        };

        if outcome.is_ok() {
            let fresh = self
                .store
                .get_run(email.run_id)
                .await?
                .unwrap_or(run);
            self.dispatcher
                .enqueue_dependents(&fresh, &node_id, &dag)
                .await?;
        }

        reconcile_run(
            self.store.as_ref(),
            self.events.as_ref(),
            email.run_id,
            dag.graph.len(),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::dag::{Dag, DagGraph, DelayTaskConfig, Node, NodeConfig};
    use crate::events::BroadcastEventBus;
    use crate::executors::testing_mailer::RecordingMailer;
    use crate::queue::TaskQueue;
    use crate::run::{Run, RunStatus};
    use crate::store::{InMemoryStateStore, SmtpCredentials};
    use uuid::Uuid;

    const KEY: [u8; 32] = *b"0123456789abcdef0123456789abcdef";

    struct Fixture {
        handler: Arc<DeferredEmailHandler>,
        store: Arc<InMemoryStateStore>,
        mailer: Arc<RecordingMailer>,
        run: Run,
        dag: Dag,
    }

    async fn fixture(mailer: RecordingMailer) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let events: Arc<BroadcastEventBus> = Arc::new(BroadcastEventBus::default());
        let queue = TaskQueue::in_memory();
        let dispatcher = Dispatcher::new(store.clone(), queue, events.clone());
        let mailer = Arc::new(mailer);

        let owner = Uuid::new_v4();
        store
            .upsert_smtp_credentials(&SmtpCredentials {
                user_id: owner,
                host: "smtp.example.com".to_string(),
                port: 587,
                username: "mailer".to_string(),
                encrypted_password: crypto::encrypt(&KEY, "hunter2"),
                from_address: "cascade@example.com".to_string(),
            })
            .await
            .unwrap();

        let dag = Dag::new(
            owner,
            "mail-flow",
            DagGraph::new(
                vec![Node::new(
                    "mail",
                    NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 }),
                )],
                vec![],
            ),
        )
        .unwrap();
        store.insert_dag(&dag).await.unwrap();

        let mut run = Run::new(dag.id, owner, "manual");
        run.status = RunStatus::Running;
        run.timeline.started_at = Some(Utc::now());
        store.insert_run(&run).await.unwrap();

        let mut record = TaskRecord::running(crate::dag::NodeId::new("mail"), "mail", 1);
        record.status = TaskStatus::Scheduled;
        store.append_task_record(run.id, &record).await.unwrap();

        let handler = Arc::new(DeferredEmailHandler::new(
            store.clone(),
            events,
            dispatcher,
            mailer.clone(),
            Some(KEY),
        ));

        Fixture {
            handler,
            store,
            mailer,
            run,
            dag,
        }
    }

    async fn insert_due_email(fixture: &Fixture) -> DeferredEmail {
        let email = DeferredEmail::new(
            fixture.run.id,
            "mail",
            fixture.dag.owner,
            "ops@example.com",
            "report",
            "done",
            Utc::now() - ChronoDuration::seconds(5),
        );
        fixture.store.insert_deferred_email(&email).await.unwrap();
        email
    }

    #[tokio::test]
    async fn test_due_email_sent_and_run_completes() {
        let fixture = fixture(RecordingMailer::default()).await;
        insert_due_email(&fixture).await;

        let processed = fixture.handler.sweep_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(fixture.mailer.sent.lock().len(), 1);

        let run = fixture.store.get_run(fixture.run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        let record = run
            .latest_record(&crate::dag::NodeId::new("mail"))
            .unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert!(record.output.as_ref().unwrap()["messageId"]
            .as_str()
            .unwrap()
            .contains("@cascade"));
    }

    #[tokio::test]
    async fn test_send_failure_fails_record_and_run() {
        let fixture = fixture(RecordingMailer::failing("mailbox full")).await;
        let email = insert_due_email(&fixture).await;

        fixture.handler.sweep_once().await.unwrap();

        let run = fixture.store.get_run(fixture.run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let record = run
            .latest_record(&crate::dag::NodeId::new("mail"))
            .unwrap();
        assert_eq!(record.status, TaskStatus::Failed);

        let pending = fixture
            .store
            .pending_deferred_for_run(fixture.run.id)
            .await
            .unwrap();
        assert!(pending.is_empty(), "row {} must not stay pending", email.id);
    }

    #[tokio::test]
    async fn test_future_email_not_swept() {
        let fixture = fixture(RecordingMailer::default()).await;
        let email = DeferredEmail::new(
            fixture.run.id,
            "mail",
            fixture.dag.owner,
            "ops@example.com",
            "report",
            "done",
            Utc::now() + ChronoDuration::seconds(300),
        );
        fixture.store.insert_deferred_email(&email).await.unwrap();

        let processed = fixture.handler.sweep_once().await.unwrap();
        assert_eq!(processed, 0);

        // Run stays open: the scheduled record holds it.
        let run = fixture.store.get_run(fixture.run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_claim_is_consumed_once() {
        let fixture = fixture(RecordingMailer::default()).await;
        insert_due_email(&fixture).await;

        assert_eq!(fixture.handler.sweep_once().await.unwrap(), 1);
        assert_eq!(fixture.handler.sweep_once().await.unwrap(), 0);
        assert_eq!(fixture.mailer.sent.lock().len(), 1);
    }
}
