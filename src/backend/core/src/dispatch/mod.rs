//! Dispatcher: materializes runs and drives dependency-ordered enqueue.
//!
//! Dependent enqueue is driven by per-task completion rather than a
//! central scheduler scan: the worker that finishes a node asks the
//! dispatcher which successors became ready. This keeps dispatch local
//! to the worker and delivers parallelism naturally on fan-out.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use uuid::Uuid;

use crate::dag::{Dag, NodeId};
use crate::error::{CascadeError, ErrorCode, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::queue::{TaskMessage, TaskQueue};
use crate::run::{Run, RunStatus};
use crate::store::StateStore;

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    queue: TaskQueue,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn StateStore>, queue: TaskQueue, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            queue,
            events,
        }
    }

    /// Materialize a run for a DAG and enqueue its frontier.
    ///
    /// Skips silently (returns `None`) when the DAG is inactive or its
    /// schedule window does not permit now. An empty frontier fails the
    /// run immediately with reason `empty_graph`.
    pub async fn create_run(&self, dag_id: Uuid, triggered_by: &str) -> Result<Option<Run>> {
        let dag = self
            .store
            .get_dag(dag_id)
            .await?
            .ok_or_else(|| CascadeError::not_found("dag", dag_id))?;

        let now = Utc::now();
        if !dag.active || !dag.schedule.window_permits(now) {
            tracing::debug!(
                dag_id = %dag_id,
                active = dag.active,
                "Skipping trigger: DAG inactive or outside its window"
            );
            return Ok(None);
        }

        let run = Run::new(dag.id, dag.owner, triggered_by);
        self.store.insert_run(&run).await?;
        counter!("cascade_runs_created_total", "triggered_by" => triggered_by.to_string())
            .increment(1);

        let frontier = dag.graph.frontier();
        if frontier.is_empty() {
            // Guarded even though acyclicity makes an all-predecessor
            // graph impossible for non-empty node sets.
            self.store
                .fail_run(run.id, "empty_graph", Utc::now())
                .await?;
            let failed = self.store.get_run(run.id).await?.unwrap_or(run);
            self.events
                .emit(ExecutionEvent::run_update(&failed))
                .await;
            tracing::warn!(dag_id = %dag_id, run_id = %failed.id, "Run failed: empty graph");
            return Ok(Some(failed));
        }

        for node in frontier {
            self.queue
                .push(&TaskMessage::new(
                    run.id,
                    dag.id,
                    node.id.as_str(),
                    Some(dag.owner),
                ))
                .await?;
        }

        self.events.emit(ExecutionEvent::run_update(&run)).await;
        tracing::info!(
            dag_id = %dag_id,
            run_id = %run.id,
            triggered_by,
            "Run created"
        );

        Ok(Some(run))
    }

    /// Enqueue every successor of `completed_node_id` whose predecessors
    /// all succeeded and which has no record yet in this run.
    ///
    /// The no-existing-record check defends against repeated delivery;
    /// ties between ready successors follow DAG-declared node order.
    pub async fn enqueue_dependents(
        &self,
        run: &Run,
        completed_node_id: &NodeId,
        dag: &Dag,
    ) -> Result<usize> {
        let mut enqueued = 0;

        for successor in dag.graph.successors(completed_node_id) {
            if run.has_record_for(&successor.id) {
                continue;
            }
            let ready = dag
                .graph
                .predecessors(&successor.id)
                .iter()
                .all(|pred| run.node_succeeded(pred));
            if !ready {
                continue;
            }

            self.queue
                .push(&TaskMessage::new(
                    run.id,
                    dag.id,
                    successor.id.as_str(),
                    Some(run.owner),
                ))
                .await?;
            enqueued += 1;
            tracing::debug!(
                run_id = %run.id,
                node_id = %successor.id,
                "Dependent enqueued"
            );
        }

        Ok(enqueued)
    }

    /// Manual cancellation: force the run to `cancelled` and fail every
    /// non-terminal task record. In-flight workers notice on their next
    /// state read and stop enqueuing dependents.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CascadeError::not_found("run", run_id))?;

        if run.status.is_terminal() {
            return Err(CascadeError::new(
                ErrorCode::InvalidStateTransition,
                format!("Run {} is already {}", run_id, run.status),
            ));
        }

        self.store.fail_open_records(run_id, "cancelled").await?;
        self.store.cancel_pending_deferred_for_run(run_id).await?;
        self.store
            .set_run_status(run_id, RunStatus::Cancelled, None, Some(Utc::now()))
            .await?;

        let cancelled = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CascadeError::not_found("run", run_id))?;
        self.events
            .emit(ExecutionEvent::run_update(&cancelled))
            .await;
        tracing::info!(run_id = %run_id, "Run cancelled");

        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{DagGraph, DelayTaskConfig, Edge, Node, NodeConfig};
    use crate::events::BroadcastEventBus;
    use crate::run::{TaskRecord, TaskStatus};
    use crate::store::InMemoryStateStore;

    fn delay_node(id: &str) -> Node {
        Node::new(id, NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 }))
    }

    async fn setup(graph: DagGraph) -> (Dispatcher, Arc<InMemoryStateStore>, TaskQueue, Dag) {
        let store = Arc::new(InMemoryStateStore::new());
        let queue = TaskQueue::in_memory();
        let events = Arc::new(BroadcastEventBus::default());
        let dag = Dag::new(Uuid::new_v4(), "test", graph).unwrap();
        store.insert_dag(&dag).await.unwrap();
        let dispatcher = Dispatcher::new(store.clone(), queue.clone(), events);
        (dispatcher, store, queue, dag)
    }

    async fn pop_message(queue: &TaskQueue) -> Option<TaskMessage> {
        queue
            .pop_raw()
            .await
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_create_run_enqueues_frontier() {
        let graph = DagGraph::new(
            vec![delay_node("a"), delay_node("b"), delay_node("c")],
            vec![Edge::new("a", "b"), Edge::new("a", "c")],
        );
        let (dispatcher, _store, queue, dag) = setup(graph).await;

        let run = dispatcher
            .create_run(dag.id, "manual")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        let msg = pop_message(&queue).await.unwrap();
        assert_eq!(msg.node_id, "a");
        assert_eq!(msg.run_id, run.id);
        assert_eq!(msg.attempt, 1);
        assert!(pop_message(&queue).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_graph_fails_immediately() {
        let (dispatcher, store, queue, dag) = setup(DagGraph::default()).await;

        let run = dispatcher
            .create_run(dag.id, "manual")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some("empty_graph"));
        assert!(pop_message(&queue).await.is_none());

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert!(stored.timeline.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_inactive_dag_skipped_silently() {
        let graph = DagGraph::new(vec![delay_node("a")], vec![]);
        let (dispatcher, store, _queue, mut dag) = setup(graph).await;
        dag.active = false;
        store.insert_dag(&dag).await.unwrap();

        let result = dispatcher.create_run(dag.id, "schedule").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_diamond_join_waits_for_both_branches() {
        let graph = DagGraph::new(
            vec![
                delay_node("a"),
                delay_node("b"),
                delay_node("c"),
                delay_node("d"),
            ],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );
        let (dispatcher, store, queue, dag) = setup(graph).await;
        let run = dispatcher
            .create_run(dag.id, "manual")
            .await
            .unwrap()
            .unwrap();
        let _ = pop_message(&queue).await;

        // a succeeded; b succeeded; c still missing -> d must wait.
        for node in ["a", "b"] {
            let mut record = TaskRecord::running(NodeId::new(node), node, 1);
            record.status = TaskStatus::Success;
            store.append_task_record(run.id, &record).await.unwrap();
        }
        let run_snapshot = store.get_run(run.id).await.unwrap().unwrap();
        let enqueued = dispatcher
            .enqueue_dependents(&run_snapshot, &NodeId::new("b"), &dag)
            .await
            .unwrap();
        assert_eq!(enqueued, 0);

        // c succeeds -> d becomes ready exactly once.
        let mut record = TaskRecord::running(NodeId::new("c"), "c", 1);
        record.status = TaskStatus::Success;
        store.append_task_record(run.id, &record).await.unwrap();

        let run_snapshot = store.get_run(run.id).await.unwrap().unwrap();
        let enqueued = dispatcher
            .enqueue_dependents(&run_snapshot, &NodeId::new("c"), &dag)
            .await
            .unwrap();
        assert_eq!(enqueued, 1);
        assert_eq!(pop_message(&queue).await.unwrap().node_id, "d");
    }

    #[tokio::test]
    async fn test_existing_record_defends_against_redelivery() {
        let graph = DagGraph::new(
            vec![delay_node("a"), delay_node("b")],
            vec![Edge::new("a", "b")],
        );
        let (dispatcher, store, _queue, dag) = setup(graph).await;
        let run = dispatcher
            .create_run(dag.id, "manual")
            .await
            .unwrap()
            .unwrap();

        for node in ["a", "b"] {
            let mut record = TaskRecord::running(NodeId::new(node), node, 1);
            record.status = TaskStatus::Success;
            store.append_task_record(run.id, &record).await.unwrap();
        }

        // b already has a record: re-delivery of a's completion enqueues nothing.
        let run_snapshot = store.get_run(run.id).await.unwrap().unwrap();
        let enqueued = dispatcher
            .enqueue_dependents(&run_snapshot, &NodeId::new("a"), &dag)
            .await
            .unwrap();
        assert_eq!(enqueued, 0);
    }

    #[tokio::test]
    async fn test_cancel_fails_open_records() {
        let graph = DagGraph::new(
            vec![delay_node("a"), delay_node("b")],
            vec![Edge::new("a", "b")],
        );
        let (dispatcher, store, _queue, dag) = setup(graph).await;
        let run = dispatcher
            .create_run(dag.id, "manual")
            .await
            .unwrap()
            .unwrap();

        store
            .append_task_record(run.id, &TaskRecord::running(NodeId::new("a"), "a", 1))
            .await
            .unwrap();

        let cancelled = dispatcher.cancel_run(run.id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.task_records[0].status, TaskStatus::Failed);
        assert_eq!(cancelled.task_records[0].error.as_deref(), Some("cancelled"));

        // Cancelling twice is an invalid transition.
        let err = dispatcher.cancel_run(run.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }
}
