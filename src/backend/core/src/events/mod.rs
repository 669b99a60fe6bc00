//! Execution event channel.
//!
//! The core emits `task.update` and `run.update` events on a well-defined
//! channel; the live-update transport that fans them out to browsers is an
//! external collaborator. In-process consumers (and tests) subscribe to
//! the broadcast sink; deployments with separate worker processes publish
//! through Redis pub/sub.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::run::{Run, RunStatus, TaskRecord, Timeline};

/// An event on the execution channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    #[serde(rename = "task.update", rename_all = "camelCase")]
    TaskUpdate {
        run_id: Uuid,
        node_id: String,
        /// Wire status: running | scheduled | retry_scheduled | success | failed
        status: String,
        attempt: u32,
        display_name: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "run.update", rename_all = "camelCase")]
    RunUpdate {
        run_id: Uuid,
        status: RunStatus,
        timeline: Timeline,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_records: Option<Vec<TaskRecord>>,
    },
}

impl ExecutionEvent {
    /// Build a `task.update` from a task record.
    pub fn task_update(run_id: Uuid, record: &TaskRecord) -> Self {
        Self::TaskUpdate {
            run_id,
            node_id: record.node_id.to_string(),
            status: record.status.wire_name().to_string(),
            attempt: record.attempts,
            display_name: record.display_name.clone(),
            timestamp: Utc::now(),
            output: record.output.clone(),
            error: record.error.clone(),
        }
    }

    /// Build a `run.update` snapshot.
    pub fn run_update(run: &Run) -> Self {
        Self::RunUpdate {
            run_id: run.id,
            status: run.status,
            timeline: run.timeline.clone(),
            task_records: Some(run.task_records.clone()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            Self::TaskUpdate { run_id, .. } | Self::RunUpdate { run_id, .. } => *run_id,
        }
    }
}

/// One-way sink for execution events.
///
/// Emission never fails the caller: a lost event degrades the live view,
/// not the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ExecutionEvent);
}

/// In-process broadcast sink; the default for tests and single-process
/// deployments.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for BroadcastEventBus {
    async fn emit(&self, event: ExecutionEvent) {
        // Send fails only when no subscriber exists, which is fine.
        let _ = self.tx.send(event);
    }
}

/// Redis pub/sub sink for multi-process deployments.
pub struct RedisEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisEventBus {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl EventSink for RedisEventBus {
    async fn emit(&self, event: ExecutionEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize execution event");
                return;
            }
        };

        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(&payload)
                .query_async(&mut conn)
                .await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                channel = %self.channel,
                error = %e,
                "Failed to publish execution event"
            );
        }
    }
}
