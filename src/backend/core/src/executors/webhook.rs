//! Webhook executor: POST a payload, optionally HMAC-signed.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use super::http::guard_url;
use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::NodeConfig;
use crate::error::{CascadeError, Result};

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Hex HMAC-SHA256 of the serialized payload.
pub(crate) fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl Executor for WebhookExecutor {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Webhook(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let url = guard_url(&config.url).await?;

        // Default payload carries the prior-node output so downstream
        // systems see what the run produced.
        let payload = config.payload.clone().unwrap_or_else(|| {
            json!({
                "run_id": ctx.run_id,
                "node_id": ctx.node_id,
                "input": ctx.input,
            })
        });
        let serialized = serde_json::to_string(&payload)?;

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(serialized.clone());

        if let Some(secret) = &config.secret {
            let signature = sign_payload(secret, &serialized);
            request = request.header(&config.signature_header, signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CascadeError::executor_failure(format!("Webhook POST failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CascadeError::executor_failure(format!(
                "Webhook returned HTTP {} from {}",
                status.as_u16(),
                config.url
            )));
        }

        Ok(ExecutorOutcome::Success(json!({
            "statusCode": status.as_u16(),
            "signed": config.secret.is_some(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_hex() {
        let sig = sign_payload("secret", r#"{"a":1}"#);
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign_payload("secret", r#"{"a":1}"#));
        assert_ne!(sig, sign_payload("other", r#"{"a":1}"#));
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
