//! In-memory queue backend for testing and development.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{DeadLetterEntry, QueueBackend};
use crate::error::Result;

/// FIFO queue held in process memory. Not durable; tests only.
#[derive(Default)]
pub struct InMemoryQueueBackend {
    queue: Mutex<VecDeque<String>>,
    dead_letter: Mutex<VecDeque<DeadLetterEntry>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn push(&self, payload: String) -> Result<()> {
        self.queue.lock().push_back(payload);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        Ok(self.queue.lock().pop_front())
    }

    async fn push_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.dead_letter.lock().push_front(entry.clone());
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.queue.lock().len())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        Ok(self
            .dead_letter
            .lock()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn dead_letter_len(&self) -> Result<usize> {
        Ok(self.dead_letter.lock().len())
    }
}
