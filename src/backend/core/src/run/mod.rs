//! Run state: one execution attempt of a DAG.

mod reconcile;

pub use reconcile::{derive_transition, reconcile_run, RunTransition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::dag::NodeId;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no task has started yet
    Queued,
    /// At least one task has started (or a deferred task holds it open)
    Running,
    /// Every node succeeded
    Success,
    /// At least one node failed, or the run was auto-failed
    Failed,
    /// Manually cancelled
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one task attempt inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Being executed by a worker
    Running,
    /// Awaiting a deferred fire time; holds the run open
    Scheduled,
    /// Failed, a later attempt is queued
    Retrying,
    /// Completed successfully
    Success,
    /// Failed terminally
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Storage name; matches the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Scheduled => "scheduled",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "scheduled" => Some(Self::Scheduled),
            "retrying" => Some(Self::Retrying),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Status string used on the event wire; `retrying` is reported as
    /// `retry_scheduled`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Retrying => "retry_scheduled",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// One executed task instance. A node that retries appends one record
/// per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub node_id: NodeId,
    pub display_name: String,
    pub status: TaskStatus,

    /// 1-indexed attempt number
    pub attempts: u32,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn running(node_id: NodeId, display_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            node_id,
            display_name: display_name.into(),
            status: TaskStatus::Running,
            attempts: attempt,
            started_at: Utc::now(),
            completed_at: None,
            output: None,
            error: None,
        }
    }
}

/// Fields of a task record a worker may change after the append.
#[derive(Debug, Clone, Default)]
pub struct TaskRecordPatch {
    pub status: Option<TaskStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskRecordPatch {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            status: Some(TaskStatus::Success),
            completed_at: Some(Utc::now()),
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            completed_at: Some(Utc::now()),
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn retrying(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Retrying),
            completed_at: Some(Utc::now()),
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn scheduled() -> Self {
        Self {
            status: Some(TaskStatus::Scheduled),
            ..Self::default()
        }
    }
}

/// Wall-clock milestones of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub queued_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Timeline {
    pub fn queued_now() -> Self {
        Self {
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One attempt at executing a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub dag_id: Uuid,
    pub owner: Uuid,
    pub status: RunStatus,
    pub timeline: Timeline,

    /// Append-only; one entry per executed task instance
    #[serde(default)]
    pub task_records: Vec<TaskRecord>,

    /// What materialized this run: "schedule", "manual", "trigger"
    pub triggered_by: String,

    /// Run-level failure reason (e.g. `empty_graph`, `auto_failed_timeout`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Run {
    pub fn new(dag_id: Uuid, owner: Uuid, triggered_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dag_id,
            owner,
            status: RunStatus::Queued,
            timeline: Timeline::queued_now(),
            task_records: Vec::new(),
            triggered_by: triggered_by.into(),
            failure_reason: None,
        }
    }

    /// The latest record for a node, if any attempt has been made.
    pub fn latest_record(&self, node_id: &NodeId) -> Option<&TaskRecord> {
        self.task_records.iter().rev().find(|r| &r.node_id == node_id)
    }

    /// Latest record per node, in first-seen order.
    pub fn latest_records(&self) -> Vec<&TaskRecord> {
        let mut by_node: HashMap<&NodeId, &TaskRecord> = HashMap::new();
        let mut order: Vec<&NodeId> = Vec::new();
        for record in &self.task_records {
            if !by_node.contains_key(&record.node_id) {
                order.push(&record.node_id);
            }
            by_node.insert(&record.node_id, record);
        }
        order.into_iter().filter_map(|id| by_node.get(id).copied()).collect()
    }

    /// Whether a node's latest attempt succeeded.
    pub fn node_succeeded(&self, node_id: &NodeId) -> bool {
        matches!(
            self.latest_record(node_id).map(|r| r.status),
            Some(TaskStatus::Success)
        )
    }

    /// Whether any attempt for this node has been recorded.
    pub fn has_record_for(&self, node_id: &NodeId) -> bool {
        self.task_records.iter().any(|r| &r.node_id == node_id)
    }
}
