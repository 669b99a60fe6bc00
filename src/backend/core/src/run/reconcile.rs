//! Run completion rule.
//!
//! The derived status of a run is recomputed on every task-record
//! mutation. All callers (worker success/failure paths, the deferred
//! email handler, the auto-fail monitor) go through [`reconcile_run`]
//! so the rule lives in exactly one place.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CascadeError, Result};
use crate::events::{EventSink, ExecutionEvent};
use crate::run::{Run, RunStatus, TaskStatus};
use crate::store::StateStore;

/// The status change a reconcile pass decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTransition {
    /// Nothing changes
    None,
    /// Promote `queued → running`
    Started { started_at: DateTime<Utc> },
    /// The run reached a terminal status
    Completed {
        status: RunStatus,
        /// Backfilled start when the run never recorded one
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    },
}

/// Apply the completion rule to a run snapshot.
///
/// Partitions the latest record per node:
/// 1. Any `scheduled` node holds the run open (deferred-email invariant).
/// 2. All nodes terminal and none in flight: `failed` if any node failed,
///    otherwise `success`.
/// 3. A `queued` run with any record is promoted to `running`.
pub fn derive_transition(run: &Run, node_count: usize) -> RunTransition {
    if run.status.is_terminal() {
        return RunTransition::None;
    }
    // An empty graph never reaches reconciliation; the dispatcher fails
    // the run at creation.
    if node_count == 0 {
        return RunTransition::None;
    }

    let latest = run.latest_records();
    let scheduled = latest
        .iter()
        .filter(|r| r.status == TaskStatus::Scheduled)
        .count();
    let in_flight = latest
        .iter()
        .filter(|r| matches!(r.status, TaskStatus::Running | TaskStatus::Retrying))
        .count();
    let completed = latest.iter().filter(|r| r.status.is_terminal()).count();
    let failed = latest
        .iter()
        .filter(|r| r.status == TaskStatus::Failed)
        .count();

    let earliest_start = run.task_records.iter().map(|r| r.started_at).min();

    if scheduled > 0 {
        return promote_if_queued(run, earliest_start);
    }

    if completed == node_count && in_flight == 0 {
        let status = if failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        let started_at = match run.timeline.started_at {
            Some(_) => None,
            None => Some(earliest_start.unwrap_or(run.timeline.queued_at)),
        };
        return RunTransition::Completed {
            status,
            started_at,
            completed_at: Utc::now(),
        };
    }

    promote_if_queued(run, earliest_start)
}

fn promote_if_queued(run: &Run, earliest_start: Option<DateTime<Utc>>) -> RunTransition {
    if run.status == RunStatus::Queued && !run.task_records.is_empty() {
        RunTransition::Started {
            started_at: earliest_start.unwrap_or_else(Utc::now),
        }
    } else {
        RunTransition::None
    }
}

/// Reload a run, derive its transition, persist it, and emit `run.update`.
///
/// Returns the run's status after reconciliation.
pub async fn reconcile_run(
    store: &dyn StateStore,
    events: &dyn EventSink,
    run_id: Uuid,
    node_count: usize,
) -> Result<RunStatus> {
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| CascadeError::not_found("run", run_id))?;

    let transition = derive_transition(&run, node_count);
    let status = match transition {
        RunTransition::None => run.status,
        RunTransition::Started { started_at } => {
            store
                .set_run_status(run_id, RunStatus::Running, Some(started_at), None)
                .await?;
            RunStatus::Running
        }
        RunTransition::Completed {
            status,
            started_at,
            completed_at,
        } => {
            store
                .set_run_status(run_id, status, started_at, Some(completed_at))
                .await?;
            tracing::info!(
                run_id = %run_id,
                status = %status,
                "Run reached terminal status"
            );
            status
        }
    };

    if let Some(updated) = store.get_run(run_id).await? {
        events.emit(ExecutionEvent::run_update(&updated)).await;
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::NodeId;
    use crate::run::TaskRecord;

    fn run_with(records: Vec<(&str, TaskStatus, u32)>) -> Run {
        let mut run = Run::new(Uuid::new_v4(), Uuid::new_v4(), "manual");
        for (node, status, attempt) in records {
            let mut record = TaskRecord::running(NodeId::new(node), node, attempt);
            record.status = status;
            run.task_records.push(record);
        }
        run
    }

    #[test]
    fn test_no_records_no_transition() {
        let run = run_with(vec![]);
        assert_eq!(derive_transition(&run, 3), RunTransition::None);
    }

    #[test]
    fn test_queued_run_promotes_on_first_record() {
        let run = run_with(vec![("a", TaskStatus::Running, 1)]);
        assert!(matches!(
            derive_transition(&run, 3),
            RunTransition::Started { .. }
        ));
    }

    #[test]
    fn test_all_success_completes_as_success() {
        let mut run = run_with(vec![
            ("a", TaskStatus::Success, 1),
            ("b", TaskStatus::Success, 1),
        ]);
        run.status = RunStatus::Running;
        run.timeline.started_at = Some(Utc::now());
        match derive_transition(&run, 2) {
            RunTransition::Completed { status, started_at, .. } => {
                assert_eq!(status, RunStatus::Success);
                assert!(started_at.is_none());
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_one_failed_completes_as_failed() {
        let mut run = run_with(vec![
            ("a", TaskStatus::Success, 1),
            ("b", TaskStatus::Failed, 3),
        ]);
        run.status = RunStatus::Running;
        run.timeline.started_at = Some(Utc::now());
        match derive_transition(&run, 2) {
            RunTransition::Completed { status, .. } => assert_eq!(status, RunStatus::Failed),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_scheduled_node_holds_run_open() {
        let mut run = run_with(vec![
            ("a", TaskStatus::Success, 1),
            ("b", TaskStatus::Scheduled, 1),
        ]);
        run.status = RunStatus::Running;
        run.timeline.started_at = Some(Utc::now());
        assert_eq!(derive_transition(&run, 2), RunTransition::None);
    }

    #[test]
    fn test_incomplete_run_stays_running() {
        let mut run = run_with(vec![("a", TaskStatus::Success, 1)]);
        run.status = RunStatus::Running;
        run.timeline.started_at = Some(Utc::now());
        assert_eq!(derive_transition(&run, 2), RunTransition::None);
    }

    #[test]
    fn test_retry_history_does_not_block_completion() {
        // Node "a" failed once, then succeeded: the stale retrying record
        // must not count as in-flight.
        let mut run = run_with(vec![
            ("a", TaskStatus::Retrying, 1),
            ("a", TaskStatus::Success, 2),
        ]);
        run.status = RunStatus::Running;
        run.timeline.started_at = Some(Utc::now());
        match derive_transition(&run, 1) {
            RunTransition::Completed { status, .. } => assert_eq!(status, RunStatus::Success),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_started_at_backfilled_when_missing() {
        let mut run = run_with(vec![("a", TaskStatus::Success, 1)]);
        run.status = RunStatus::Running;
        // started_at never stamped
        match derive_transition(&run, 1) {
            RunTransition::Completed { started_at, .. } => assert!(started_at.is_some()),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_run_never_transitions() {
        let mut run = run_with(vec![("a", TaskStatus::Success, 1)]);
        run.status = RunStatus::Cancelled;
        assert_eq!(derive_transition(&run, 1), RunTransition::None);
    }
}
