//! Notification executor: Slack- and Discord-flavored webhook posts.

use async_trait::async_trait;
use serde_json::json;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::{NodeConfig, NotificationPlatform};
use crate::error::{CascadeError, Result};

pub struct NotificationExecutor {
    client: reqwest::Client,
}

impl NotificationExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Shape the platform-specific payload.
pub(crate) fn shape_payload(
    platform: NotificationPlatform,
    message: &str,
    username: Option<&str>,
) -> serde_json::Value {
    match platform {
        NotificationPlatform::Slack => {
            let mut payload = json!({ "text": message });
            if let Some(username) = username {
                payload["username"] = json!(username);
            }
            payload
        }
        NotificationPlatform::Discord => {
            let mut payload = json!({ "content": message });
            if let Some(username) = username {
                payload["username"] = json!(username);
            }
            payload
        }
    }
}

#[async_trait]
impl Executor for NotificationExecutor {
    fn kind(&self) -> &'static str {
        "notification"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Notification(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let payload = shape_payload(config.platform, &config.message, config.username.as_deref());

        let response = self
            .client
            .post(&config.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                CascadeError::executor_failure(format!("Notification POST failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CascadeError::executor_failure(format!(
                "Notification platform returned HTTP {}",
                status.as_u16()
            )));
        }

        Ok(ExecutorOutcome::Success(json!({
            "delivered": true,
            "statusCode": status.as_u16(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slack_payload_shape() {
        let payload = shape_payload(NotificationPlatform::Slack, "deploy done", None);
        assert_eq!(payload["text"], "deploy done");
        assert!(payload.get("content").is_none());
    }

    #[test]
    fn test_discord_payload_shape() {
        let payload =
            shape_payload(NotificationPlatform::Discord, "deploy done", Some("cascade"));
        assert_eq!(payload["content"], "deploy done");
        assert_eq!(payload["username"], "cascade");
        assert!(payload.get("text").is_none());
    }
}
