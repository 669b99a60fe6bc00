//! Delay executor.

use async_trait::async_trait;
use serde_json::json;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::NodeConfig;
use crate::error::Result;

/// Upper bound on a single delay: one hour.
const MAX_DELAY_MS: u64 = 3_600_000;

#[derive(Default)]
pub struct DelayExecutor;

impl DelayExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for DelayExecutor {
    fn kind(&self) -> &'static str {
        "delay"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Delay(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let duration_ms = config.duration_ms.min(MAX_DELAY_MS);
        tokio::time::sleep(std::time::Duration::from_millis(duration_ms)).await;

        Ok(ExecutorOutcome::Success(json!({
            "sleptMs": duration_ms,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DelayTaskConfig;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_sleeps_for_duration() {
        let executor = DelayExecutor::new();
        let ctx = ExecutionContext::new(Uuid::new_v4(), "wait");
        let config = NodeConfig::Delay(DelayTaskConfig { duration_ms: 20 });

        let started = std::time::Instant::now();
        let outcome = executor.execute(&config, &ctx).await.unwrap();
        assert!(started.elapsed().as_millis() >= 20);

        match outcome {
            ExecutorOutcome::Success(value) => assert_eq!(value["sleptMs"], 20),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_clamped_to_one_hour() {
        let executor = DelayExecutor::new();
        let ctx = ExecutionContext::new(Uuid::new_v4(), "wait");
        let config = NodeConfig::Delay(DelayTaskConfig {
            duration_ms: u64::MAX,
        });

        let outcome = executor.execute(&config, &ctx).await.unwrap();
        match outcome {
            ExecutorOutcome::Success(value) => {
                assert_eq!(value["sleptMs"], MAX_DELAY_MS)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
