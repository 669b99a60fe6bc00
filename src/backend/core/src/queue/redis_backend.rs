//! Redis-backed queue for production use.
//!
//! The main queue is a Redis list: producers LPUSH at the head,
//! consumers RPOP from the tail, so older enqueues are consumed first.
//! The dead-letter sibling lives under `<key>:dead`.

use async_trait::async_trait;

use super::{DeadLetterEntry, QueueBackend};
use crate::error::Result;

pub struct RedisQueueBackend {
    client: redis::Client,
    queue_key: String,
    dead_letter_key: String,
}

impl RedisQueueBackend {
    /// Create a new Redis queue backend.
    ///
    /// # Arguments
    /// * `client` - A connected Redis client
    /// * `queue_key` - The Redis list key to use (e.g. `"cascade:tasks"`)
    pub fn new(client: redis::Client, queue_key: impl Into<String>) -> Self {
        let queue_key = queue_key.into();
        let dead_letter_key = format!("{}:dead", queue_key);
        Self {
            client,
            queue_key,
            dead_letter_key,
        }
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, payload: String) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        tracing::debug!(queue = %self.queue_key, "Message enqueued");
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = redis::cmd("RPOP")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        let serialized = serde_json::to_string(entry)?;
        let mut conn = self.conn().await?;
        redis::cmd("LPUSH")
            .arg(&self.dead_letter_key)
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn().await?;
        let length: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.dead_letter_key)
            .arg(0)
            .arg(limit.saturating_sub(1) as i64)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable dead-letter entry")
                }
            }
        }
        Ok(entries)
    }

    async fn dead_letter_len(&self) -> Result<usize> {
        let mut conn = self.conn().await?;
        let length: usize = redis::cmd("LLEN")
            .arg(&self.dead_letter_key)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }
}
