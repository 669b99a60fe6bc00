//! Worker: pop → execute → persist → emit → enqueue successors.
//!
//! Per task message:
//!
//! ```text
//!             ┌─► success ──► enqueue dependents
//! pop ─► running ─┼─► scheduled (deferred email) ──► run remains open
//!             └─► failure ─┬─► attempt < max : wait(backoff) → requeue
//!                          └─► attempt = max : dead-letter + record=failed
//! ```
//!
//! Execution is at-least-once: a duplicate delivery of an attempt is
//! dropped when a record for that attempt already exists, but the window
//! between check and append is not locked across workers.

mod heartbeat;

pub use heartbeat::ResourceSampler;

use chrono::Utc;
use metrics::counter;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::dag::{Dag, Node, NodeId};
use crate::dispatch::Dispatcher;
use crate::error::{CascadeError, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::executors::{ExecutionContext, ExecutorOutcome, ExecutorRegistry};
use crate::queue::{TaskMessage, TaskQueue};
use crate::run::{reconcile_run, Run, TaskRecord, TaskRecordPatch, TaskStatus};
use crate::store::{StateStore, WorkerRecord, WorkerStatus};

/// Live execution counters shared by the poll loops and the heartbeat.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub in_progress: AtomicU32,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal the worker to drain and wait for its loops to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

struct WorkerInner {
    id: String,
    store: Arc<dyn StateStore>,
    queue: TaskQueue,
    events: Arc<dyn EventSink>,
    registry: Arc<ExecutorRegistry>,
    dispatcher: Dispatcher,
    config: WorkerConfig,
    poll_interval: Duration,
    stats: WorkerStats,
}

/// A stateless worker process: any instance may execute any task.
#[derive(Clone)]
pub struct TaskWorker {
    inner: Arc<WorkerInner>,
}

impl TaskWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: TaskQueue,
        events: Arc<dyn EventSink>,
        registry: Arc<ExecutorRegistry>,
        config: WorkerConfig,
        poll_interval: Duration,
    ) -> Self {
        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), events.clone());
        let id = format!("{}-{}", config.name, &Uuid::new_v4().to_string()[..8]);
        Self {
            inner: Arc::new(WorkerInner {
                id,
                store,
                queue,
                events,
                registry,
                dispatcher,
                config,
                poll_interval,
                stats: WorkerStats::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    /// Start the poll loops and the heartbeat; returns a control handle.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut tasks = Vec::new();

        tracing::info!(
            worker = %self.inner.id,
            concurrency = self.inner.config.concurrency,
            "Worker started"
        );

        for _ in 0..self.inner.config.concurrency.max(1) {
            let worker = self.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match worker.process_one().await {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = shutdown.changed() => {}
                                _ = tokio::time::sleep(worker.inner.poll_interval) => {}
                            }
                        }
                        Err(e) => {
                            // Queue/store trouble: retry in place after a
                            // short backoff rather than spinning.
                            e.log();
                            tokio::select! {
                                _ = shutdown.changed() => {}
                                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                            }
                        }
                    }
                }
                tracing::info!(worker = %worker.inner.id, "Worker loop stopped");
            }));
        }

        // Heartbeat loop.
        {
            let worker = self.clone();
            let mut shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                let mut sampler = ResourceSampler::new();
                let interval = Duration::from_secs(worker.inner.config.heartbeat_secs.max(1));
                loop {
                    worker.beat(&mut sampler, None).await;
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                // Final heartbeat announces the drain so monitors do not
                // reap this worker mid-shutdown.
                worker.beat(&mut sampler, Some(WorkerStatus::Draining)).await;
                tracing::info!(worker = %worker.inner.id, "Worker draining");
            }));
        }

        WorkerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    async fn beat(&self, sampler: &mut ResourceSampler, status_override: Option<WorkerStatus>) {
        let (cpu_load, memory_mb) = sampler.sample();
        let in_progress = self.inner.stats.in_progress.load(Ordering::Relaxed);
        let status = status_override.unwrap_or(if in_progress > 0 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        });

        let record = WorkerRecord {
            worker_id: self.inner.id.clone(),
            status,
            last_heartbeat: Utc::now(),
            started_at: Utc::now(),
            cpu_load,
            memory_mb,
            tasks_in_progress: in_progress,
            tasks_completed: self.inner.stats.completed.load(Ordering::Relaxed),
            tasks_failed: self.inner.stats.failed.load(Ordering::Relaxed),
        };

        if let Err(e) = self.inner.store.upsert_worker(&record).await {
            tracing::warn!(worker = %self.inner.id, error = %e, "Heartbeat upsert failed");
        }
    }

    /// Pop and process one message. Returns false when the queue was
    /// empty. Exposed so tests can drive the worker deterministically.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(raw) = self.inner.queue.pop_raw().await? else {
            return Ok(false);
        };

        let message: TaskMessage = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable task message");
                self.inner
                    .queue
                    .move_to_dead_letter(raw, "invalid_json")
                    .await?;
                return Ok(true);
            }
        };

        self.inner.stats.in_progress.fetch_add(1, Ordering::Relaxed);
        let result = self.handle_message(&raw, &message).await;
        self.inner.stats.in_progress.fetch_sub(1, Ordering::Relaxed);

        if let Err(e) = result {
            tracing::error!(
                run_id = %message.run_id,
                node_id = %message.node_id,
                error = %e,
                "Task handling hit infrastructure trouble; re-pushing message"
            );
            // The popped message is still owned by this worker: retry in
            // place by re-pushing, falling back to the dead-letter list.
            if let Err(push_err) = self.inner.queue.push(&message).await {
                push_err.log();
                let reason = format!("infra_transient:{}", e.user_message());
                if let Err(dl_err) = self.inner.queue.move_to_dead_letter(raw, reason).await {
                    dl_err.log();
                }
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn handle_message(&self, raw: &str, message: &TaskMessage) -> Result<()> {
        // Missing run: the run was deleted or never persisted. Drop.
        let Some(run) = self.inner.store.get_run(message.run_id).await? else {
            tracing::warn!(run_id = %message.run_id, "Dropping message for unknown run");
            return Ok(());
        };

        // Cancelled and otherwise terminal runs ignore late messages.
        if run.status.is_terminal() {
            tracing::debug!(
                run_id = %run.id,
                status = %run.status,
                "Dropping message for terminal run"
            );
            return Ok(());
        }

        // Missing DAG: fail the task and surface the message to operators.
        let Some(dag) = self.inner.store.get_dag(message.dag_id).await? else {
            self.fail_task(
                &run,
                &NodeId::new(message.node_id.clone()),
                &message.node_id,
                message.attempt,
                "dag_deleted",
                None,
            )
            .await?;
            self.inner
                .queue
                .move_to_dead_letter(raw, "dag_deleted")
                .await?;
            return Ok(());
        };

        let node_id = NodeId::new(message.node_id.clone());
        let Some(node) = dag.graph.node(&node_id) else {
            self.inner
                .queue
                .move_to_dead_letter(raw, "node_not_found")
                .await?;
            return Ok(());
        };

        // Duplicate delivery: an attempt at or past this number already ran.
        if let Some(existing) = run.latest_record(&node_id) {
            if existing.attempts >= message.attempt {
                tracing::debug!(
                    run_id = %run.id,
                    node_id = %node_id,
                    attempt = message.attempt,
                    "Dropping duplicate delivery"
                );
                return Ok(());
            }
        }

        // Append the running record and promote the run if queued.
        let record = TaskRecord::running(node_id.clone(), &node.display_name, message.attempt);
        self.inner.store.append_task_record(run.id, &record).await?;
        self.inner
            .events
            .emit(ExecutionEvent::task_update(run.id, &record))
            .await;
        reconcile_run(
            self.inner.store.as_ref(),
            self.inner.events.as_ref(),
            run.id,
            dag.graph.len(),
        )
        .await?;

        let outcome = self.execute_node(&run, &dag, node, message).await;
        match outcome {
            Ok(ExecutorOutcome::Success(output)) => {
                self.complete_task(&run, &dag, node, message.attempt, output)
                    .await
            }
            Ok(ExecutorOutcome::Scheduled(draft)) => {
                self.schedule_task(&run, &dag, node, message.attempt, draft)
                    .await
            }
            Err(error) => self.handle_failure(raw, &run, &dag, node, message, error).await,
        }
    }

    async fn execute_node(
        &self,
        run: &Run,
        dag: &Dag,
        node: &Node,
        message: &TaskMessage,
    ) -> Result<ExecutorOutcome> {
        let executor = self.inner.registry.get(node.kind())?;

        let input = gather_input(run, dag, &node.id);
        let ctx = ExecutionContext::new(run.id, node.id.as_str())
            .with_user(message.user_id.or(Some(run.owner)))
            .with_input(input)
            .with_attempt(message.attempt);

        let timeout_ms = node
            .config
            .timeout_ms()
            .unwrap_or(self.inner.config.task_timeout_secs * 1000);

        tracing::info!(
            worker = %self.inner.id,
            run_id = %run.id,
            node_id = %node.id,
            kind = node.kind(),
            attempt = message.attempt,
            "Executing task"
        );

        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            executor.execute(&node.config, &ctx),
        )
        .await
        .unwrap_or_else(|_| {
            Err(CascadeError::executor_timeout(format!(
                "Task exceeded its {} ms deadline",
                timeout_ms
            )))
        })
    }

    async fn complete_task(
        &self,
        run: &Run,
        dag: &Dag,
        node: &Node,
        attempt: u32,
        output: serde_json::Value,
    ) -> Result<()> {
        self.inner
            .store
            .update_task_record(run.id, node.id.as_str(), TaskRecordPatch::success(output.clone()))
            .await?;
        self.inner.stats.completed.fetch_add(1, Ordering::Relaxed);
        counter!("cascade_tasks_total", "status" => "success").increment(1);

        // Dependents are enqueued only after the success record is
        // persisted, then completion is re-evaluated.
        let fresh = self.load_run(run.id).await?;
        self.inner
            .dispatcher
            .enqueue_dependents(&fresh, &node.id, dag)
            .await?;
        reconcile_run(
            self.inner.store.as_ref(),
            self.inner.events.as_ref(),
            run.id,
            dag.graph.len(),
        )
        .await?;

        let mut record = TaskRecord::running(node.id.clone(), &node.display_name, attempt);
        record.status = TaskStatus::Success;
        record.output = Some(output);
        record.completed_at = Some(Utc::now());
        self.inner
            .events
            .emit(ExecutionEvent::task_update(run.id, &record))
            .await;

        Ok(())
    }

    async fn schedule_task(
        &self,
        run: &Run,
        dag: &Dag,
        node: &Node,
        attempt: u32,
        draft: crate::store::DeferredEmail,
    ) -> Result<()> {
        self.inner.store.insert_deferred_email(&draft).await?;
        self.inner
            .store
            .update_task_record(run.id, node.id.as_str(), TaskRecordPatch::scheduled())
            .await?;
        counter!("cascade_tasks_total", "status" => "scheduled").increment(1);

        // No dependents; the deferred handler enqueues them at fire time.
        reconcile_run(
            self.inner.store.as_ref(),
            self.inner.events.as_ref(),
            run.id,
            dag.graph.len(),
        )
        .await?;

        let mut record = TaskRecord::running(node.id.clone(), &node.display_name, attempt);
        record.status = TaskStatus::Scheduled;
        self.inner
            .events
            .emit(ExecutionEvent::task_update(run.id, &record))
            .await;

        Ok(())
    }

    async fn handle_failure(
        &self,
        raw: &str,
        run: &Run,
        dag: &Dag,
        node: &Node,
        message: &TaskMessage,
        error: CascadeError,
    ) -> Result<()> {
        let cause = error.user_message().to_string();

        if error.is_fatal_for_task() {
            let reason = match error.code() {
                crate::error::ErrorCode::SsrfBlocked => format!("ssrf_blocked:{}", cause),
                crate::error::ErrorCode::ConfigMissing => format!("config_missing:{}", cause),
                _ => cause.clone(),
            };
            self.fail_task(run, &node.id, &node.display_name, message.attempt, &cause, Some(dag))
                .await?;
            self.inner.queue.move_to_dead_letter(raw, reason).await?;
            return Ok(());
        }

        let policy = dag.effective_retry(node);
        if message.attempt < policy.max_attempts {
            self.inner
                .store
                .update_task_record(
                    run.id,
                    node.id.as_str(),
                    TaskRecordPatch::retrying(cause.clone()),
                )
                .await?;
            counter!("cascade_tasks_total", "status" => "retrying").increment(1);

            let mut record =
                TaskRecord::running(node.id.clone(), &node.display_name, message.attempt);
            record.status = TaskStatus::Retrying;
            record.error = Some(cause.clone());
            self.inner
                .events
                .emit(ExecutionEvent::task_update(run.id, &record))
                .await;

            tracing::warn!(
                run_id = %run.id,
                node_id = %node.id,
                attempt = message.attempt,
                max_attempts = policy.max_attempts,
                backoff_ms = policy.backoff_ms,
                error = %cause,
                "Task failed; retry scheduled"
            );

            // Requeue after the backoff without blocking this loop.
            let queue = self.inner.queue.clone();
            let next = message.next_attempt();
            let backoff = Duration::from_millis(policy.backoff_ms);
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                if let Err(e) = queue.push(&next).await {
                    tracing::error!(
                        run_id = %next.run_id,
                        node_id = %next.node_id,
                        error = %e,
                        "Failed to requeue retry"
                    );
                }
            });
            return Ok(());
        }

        self.fail_task(run, &node.id, &node.display_name, message.attempt, &cause, Some(dag))
            .await?;
        self.inner
            .queue
            .move_to_dead_letter(raw, format!("max_retries_exceeded:{}", cause))
            .await?;
        Ok(())
    }

    /// Write a terminal failed record, emit, and re-evaluate completion.
    async fn fail_task(
        &self,
        run: &Run,
        node_id: &NodeId,
        display_name: &str,
        attempt: u32,
        error: &str,
        dag: Option<&Dag>,
    ) -> Result<()> {
        let updated = self
            .inner
            .store
            .update_task_record(run.id, node_id.as_str(), TaskRecordPatch::failed(error))
            .await?;
        if !updated {
            // No running record was appended (e.g. the DAG vanished before
            // execution): append a terminal one so the failure is visible.
            let mut record = TaskRecord::running(node_id.clone(), display_name, attempt);
            record.status = TaskStatus::Failed;
            record.error = Some(error.to_string());
            record.completed_at = Some(Utc::now());
            self.inner.store.append_task_record(run.id, &record).await?;
        }
        self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        counter!("cascade_tasks_total", "status" => "failed").increment(1);

        if let Some(dag) = dag {
            reconcile_run(
                self.inner.store.as_ref(),
                self.inner.events.as_ref(),
                run.id,
                dag.graph.len(),
            )
            .await?;
        }

        let mut record = TaskRecord::running(node_id.clone(), display_name, attempt);
        record.status = TaskStatus::Failed;
        record.error = Some(error.to_string());
        record.completed_at = Some(Utc::now());
        self.inner
            .events
            .emit(ExecutionEvent::task_update(run.id, &record))
            .await;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Run> {
        self.inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CascadeError::not_found("run", run_id))
    }
}

/// Resolve the input for a node from its predecessors' outputs: the
/// single predecessor's output, or an object keyed by node id.
fn gather_input(run: &Run, dag: &Dag, node_id: &NodeId) -> serde_json::Value {
    let predecessors = dag.graph.predecessors(node_id);
    match predecessors.len() {
        0 => serde_json::Value::Null,
        1 => run
            .latest_record(predecessors[0])
            .and_then(|r| r.output.clone())
            .unwrap_or(serde_json::Value::Null),
        _ => {
            let mut map = serde_json::Map::new();
            for pred in predecessors {
                let output = run
                    .latest_record(pred)
                    .and_then(|r| r.output.clone())
                    .unwrap_or(serde_json::Value::Null);
                map.insert(pred.to_string(), output);
            }
            serde_json::Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DagGraph, DelayTaskConfig, Edge, NodeConfig};
    use crate::run::TaskStatus;

    fn delay_node(id: &str) -> Node {
        Node::new(id, NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 }))
    }

    #[test]
    fn test_gather_input_single_predecessor() {
        let graph = DagGraph::new(
            vec![delay_node("a"), delay_node("b")],
            vec![Edge::new("a", "b")],
        );
        let dag = Dag::new(Uuid::new_v4(), "t", graph).unwrap();
        let mut run = Run::new(dag.id, dag.owner, "manual");

        let mut record = TaskRecord::running(NodeId::new("a"), "a", 1);
        record.status = TaskStatus::Success;
        record.output = Some(serde_json::json!({"n": 1}));
        run.task_records.push(record);

        let input = gather_input(&run, &dag, &NodeId::new("b"));
        assert_eq!(input, serde_json::json!({"n": 1}));
    }

    #[test]
    fn test_gather_input_fan_in_keyed_by_node() {
        let graph = DagGraph::new(
            vec![delay_node("a"), delay_node("b"), delay_node("c")],
            vec![Edge::new("a", "c"), Edge::new("b", "c")],
        );
        let dag = Dag::new(Uuid::new_v4(), "t", graph).unwrap();
        let mut run = Run::new(dag.id, dag.owner, "manual");

        for (node, value) in [("a", 1), ("b", 2)] {
            let mut record = TaskRecord::running(NodeId::new(node), node, 1);
            record.status = TaskStatus::Success;
            record.output = Some(serde_json::json!(value));
            run.task_records.push(record);
        }

        let input = gather_input(&run, &dag, &NodeId::new("c"));
        assert_eq!(input, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_gather_input_root_is_null() {
        let graph = DagGraph::new(vec![delay_node("a")], vec![]);
        let dag = Dag::new(Uuid::new_v4(), "t", graph).unwrap();
        let run = Run::new(dag.id, dag.owner, "manual");
        assert_eq!(
            gather_input(&run, &dag, &NodeId::new("a")),
            serde_json::Value::Null
        );
    }
}
