//! Task queue with dead-letter handling.
//!
//! A durable FIFO list of task messages plus a parallel dead-letter
//! list. Delivery is at-least-once: consumers must tolerate repeated
//! delivery of the same message. There is no visibility timeout — a
//! popped message is owned by its worker until a terminal record is
//! written or the message is re-pushed.

mod memory;
mod redis_backend;

pub use memory::InMemoryQueueBackend;
pub use redis_backend::RedisQueueBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// One unit of work on the queue.
///
/// The node's config is resolved from the DAG at consumption time and
/// never stored in the message, so DAG edits don't bifurcate behavior
/// within an in-flight run. Unknown fields are tolerated on parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub run_id: Uuid,
    pub dag_id: Uuid,
    pub node_id: String,

    /// 1-indexed attempt number
    #[serde(default = "default_attempt")]
    pub attempt: u32,

    #[serde(default)]
    pub user_id: Option<Uuid>,
}

fn default_attempt() -> u32 {
    1
}

impl TaskMessage {
    pub fn new(run_id: Uuid, dag_id: Uuid, node_id: impl Into<String>, user_id: Option<Uuid>) -> Self {
        Self {
            run_id,
            dag_id,
            node_id: node_id.into(),
            attempt: 1,
            user_id,
        }
    }

    /// The same message at the next attempt number.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A message that will not be retried automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The raw payload as it was on the queue
    pub payload: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(payload: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Messages waiting to be consumed
    pub pending: usize,
    /// Entries on the dead-letter list
    pub dead_letter: usize,
}

/// Trait for queue backends.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Push a raw payload at the head of the list.
    async fn push(&self, payload: String) -> Result<()>;

    /// Pop the next payload from the tail. Non-blocking; `None` means
    /// empty and the consumer sleeps its poll interval.
    async fn pop(&self) -> Result<Option<String>>;

    /// Append an entry to the dead-letter sibling.
    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()>;

    /// Pending message count.
    async fn len(&self) -> Result<usize>;

    /// Peek dead-letter entries without consuming them, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Dead-letter entry count.
    async fn dead_letter_len(&self) -> Result<usize>;
}

/// The task queue used by dispatcher and workers.
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// In-memory queue for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new()))
    }

    /// Enqueue a task message.
    pub async fn push(&self, message: &TaskMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.backend.push(payload).await?;
        counter!("cascade_queue_pushed_total").increment(1);
        Ok(())
    }

    /// Pop the next raw payload. The worker parses it so that invalid
    /// JSON can be dead-lettered with the original bytes.
    pub async fn pop_raw(&self) -> Result<Option<String>> {
        self.backend.pop().await
    }

    /// Move a payload to the dead-letter list.
    pub async fn move_to_dead_letter(
        &self,
        payload: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<()> {
        let entry = DeadLetterEntry::new(payload, reason);
        tracing::warn!(reason = %entry.reason, "Message moved to dead-letter queue");
        self.backend.push_dead_letter(&entry).await?;
        counter!("cascade_queue_dead_lettered_total").increment(1);
        Ok(())
    }

    /// Queue statistics.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.backend.len().await?,
            dead_letter: self.backend.dead_letter_len().await?,
        })
    }

    /// List dead-letter entries without consuming them.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.backend.dead_letters(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_round_trip() {
        let queue = TaskQueue::in_memory();
        let run_id = Uuid::new_v4();
        let dag_id = Uuid::new_v4();

        queue
            .push(&TaskMessage::new(run_id, dag_id, "a", None))
            .await
            .unwrap();
        queue
            .push(&TaskMessage::new(run_id, dag_id, "b", None))
            .await
            .unwrap();

        let first: TaskMessage =
            serde_json::from_str(&queue.pop_raw().await.unwrap().unwrap()).unwrap();
        let second: TaskMessage =
            serde_json::from_str(&queue.pop_raw().await.unwrap().unwrap()).unwrap();

        assert_eq!(first.node_id, "a");
        assert_eq!(first.run_id, run_id);
        assert_eq!(first.attempt, 1);
        assert_eq!(second.node_id, "b");
        assert!(queue.pop_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_visible_to_operators() {
        let queue = TaskQueue::in_memory();
        queue
            .move_to_dead_letter("{\"bad\":true}", "invalid_json")
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_letter, 1);

        let entries = queue.dead_letters(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "invalid_json");
        assert_eq!(entries[0].payload, "{\"bad\":true}");
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let raw = r#"{"runId":"5f4dcc3b-0000-4000-8000-000000000000",
                      "dagId":"5f4dcc3b-0000-4000-8000-000000000001",
                      "nodeId":"n1","attempt":2,"userId":null,
                      "mysteryField":42}"#;
        let msg: TaskMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.node_id, "n1");
        assert_eq!(msg.attempt, 2);
    }

    #[test]
    fn test_missing_node_id_fails_parse() {
        let raw = r#"{"runId":"5f4dcc3b-0000-4000-8000-000000000000",
                      "dagId":"5f4dcc3b-0000-4000-8000-000000000001"}"#;
        assert!(serde_json::from_str::<TaskMessage>(raw).is_err());
    }

    #[test]
    fn test_next_attempt_increments() {
        let msg = TaskMessage::new(Uuid::new_v4(), Uuid::new_v4(), "a", None);
        assert_eq!(msg.next_attempt().attempt, 2);
    }
}
