//! Email executor: synchronous SMTP send or deferred scheduling.
//!
//! With `scheduled=true` and a fire time more than ten seconds out, the
//! executor returns a deferred draft instead of sending; the node enters
//! the `scheduled` state and the deferred email handler completes it
//! later. Otherwise the owner's SMTP credentials are loaded, decrypted,
//! and the message is sent before the task records success.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::crypto;
use crate::dag::NodeConfig;
use crate::error::{CascadeError, Result};
use crate::store::{DeferredEmail, StateStore};

/// Sends inside this horizon happen immediately even when `scheduled`.
const DEFER_THRESHOLD_SECS: i64 = 10;

/// A fully resolved outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// SMTP transport abstraction; tests substitute a recording fake.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one message over the given account; returns the message id.
    async fn send(&self, account: &SmtpAccount, email: &OutgoingEmail) -> Result<String>;
}

/// Decrypted SMTP account details.
#[derive(Debug, Clone)]
pub struct SmtpAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Production mailer over lettre's async SMTP transport.
pub struct SmtpMailer;

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, account: &SmtpAccount, email: &OutgoingEmail) -> Result<String> {
        let from: Mailbox = email.from.parse().map_err(|e| {
            CascadeError::config_missing(format!("Invalid sender address {:?}: {}", email.from, e))
        })?;
        let to: Mailbox = email.to.parse().map_err(|e| {
            CascadeError::validation(format!("Invalid recipient address {:?}: {}", email.to, e))
        })?;

        let message_id = format!("<{}@cascade>", Uuid::new_v4());
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .message_id(Some(message_id.clone()))
            .body(email.body.clone())
            .map_err(|e| CascadeError::executor_failure(format!("Failed to build email: {}", e)))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&account.host)
            .map_err(|e| {
                CascadeError::executor_failure(format!("Invalid SMTP relay {}: {}", account.host, e))
            })?
            .port(account.port)
            .credentials(Credentials::new(
                account.username.clone(),
                account.password.clone(),
            ))
            .build();

        transport.send(message).await.map_err(|e| {
            CascadeError::executor_failure(format!("SMTP send failed: {}", e))
        })?;

        Ok(message_id)
    }
}

/// Load and decrypt the owner's SMTP account plus sender address.
pub(crate) async fn resolve_account(
    store: &dyn StateStore,
    encryption_key: Option<&[u8; 32]>,
    user_id: Option<Uuid>,
) -> Result<(SmtpAccount, String)> {
    let user_id = user_id
        .ok_or_else(|| CascadeError::config_missing("Email task has no owning user for credential lookup"))?;

    let credentials = store
        .get_smtp_credentials(user_id)
        .await?
        .ok_or_else(|| {
            CascadeError::config_missing(format!("No SMTP credentials configured for user {}", user_id))
        })?;

    let key = encryption_key
        .ok_or_else(|| CascadeError::config_missing("ENCRYPTION_KEY is not configured"))?;
    let password = crypto::decrypt(key, &credentials.encrypted_password)?;

    Ok((
        SmtpAccount {
            host: credentials.host,
            port: credentials.port,
            username: credentials.username,
            password,
        },
        credentials.from_address,
    ))
}

pub struct EmailExecutor {
    store: Arc<dyn StateStore>,
    mailer: Arc<dyn Mailer>,
    encryption_key: Option<[u8; 32]>,
}

impl EmailExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        mailer: Arc<dyn Mailer>,
        encryption_key: Option<[u8; 32]>,
    ) -> Self {
        Self {
            store,
            mailer,
            encryption_key,
        }
    }
}

#[async_trait]
impl Executor for EmailExecutor {
    fn kind(&self) -> &'static str {
        "email"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Email(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        if config.scheduled {
            if let Some(fire_at) = config.fire_at {
                if fire_at > Utc::now() + Duration::seconds(DEFER_THRESHOLD_SECS) {
                    let user_id = ctx.user_id.ok_or_else(|| {
                        CascadeError::config_missing(
                            "Scheduled email has no owning user for credential lookup",
                        )
                    })?;
                    let draft = DeferredEmail::new(
                        ctx.run_id,
                        ctx.node_id.clone(),
                        user_id,
                        config.to.clone(),
                        config.subject.clone(),
                        config.body.clone(),
                        fire_at,
                    );
                    tracing::info!(
                        run_id = %ctx.run_id,
                        node_id = %ctx.node_id,
                        fire_at = %fire_at,
                        "Email deferred"
                    );
                    return Ok(ExecutorOutcome::Scheduled(draft));
                }
            }
        }

        let (account, from_address) =
            resolve_account(self.store.as_ref(), self.encryption_key.as_ref(), ctx.user_id).await?;

        let email = OutgoingEmail {
            from: from_address,
            to: config.to.clone(),
            subject: config.subject.clone(),
            body: config.body.clone(),
        };
        let message_id = self.mailer.send(&account, &email).await?;

        Ok(ExecutorOutcome::Success(json!({
            "messageId": message_id,
            "recipient": config.to,
            "sentAt": Utc::now(),
        })))
    }
}

/// Test doubles shared by unit and integration tests.
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every send; optionally fails each one.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<OutgoingEmail>>,
        pub fail_with: Option<String>,
    }

    impl RecordingMailer {
        pub fn failing(reason: impl Into<String>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_with: Some(reason.into()),
            }
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, _account: &SmtpAccount, email: &OutgoingEmail) -> Result<String> {
            if let Some(reason) = &self.fail_with {
                return Err(CascadeError::executor_failure(reason.clone()));
            }
            self.sent.lock().push(email.clone());
            Ok(format!("<{}@cascade>", Uuid::new_v4()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingMailer;
    use super::*;
    use crate::dag::EmailTaskConfig;
    use crate::store::{InMemoryStateStore, SmtpCredentials};

    const KEY: [u8; 32] = *b"0123456789abcdef0123456789abcdef";

    fn email_config(scheduled: bool, fire_at: Option<chrono::DateTime<Utc>>) -> NodeConfig {
        NodeConfig::Email(EmailTaskConfig {
            to: "ops@example.com".to_string(),
            subject: "report".to_string(),
            body: "done".to_string(),
            scheduled,
            fire_at,
        })
    }

    async fn store_with_credentials(user_id: Uuid) -> Arc<InMemoryStateStore> {
        let store = Arc::new(InMemoryStateStore::new());
        store
            .upsert_smtp_credentials(&SmtpCredentials {
                user_id,
                host: "smtp.example.com".to_string(),
                port: 587,
                username: "mailer".to_string(),
                encrypted_password: crypto::encrypt(&KEY, "hunter2"),
                from_address: "cascade@example.com".to_string(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_immediate_send() {
        let user_id = Uuid::new_v4();
        let store = store_with_credentials(user_id).await;
        let mailer = Arc::new(RecordingMailer::default());
        let executor = EmailExecutor::new(store, mailer.clone(), Some(KEY));

        let ctx = ExecutionContext::new(Uuid::new_v4(), "mail").with_user(Some(user_id));
        let outcome = executor
            .execute(&email_config(false, None), &ctx)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutorOutcome::Success(_)));
        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "cascade@example.com");
        assert_eq!(sent[0].to, "ops@example.com");
    }

    #[tokio::test]
    async fn test_far_future_send_defers() {
        let user_id = Uuid::new_v4();
        let store = store_with_credentials(user_id).await;
        let mailer = Arc::new(RecordingMailer::default());
        let executor = EmailExecutor::new(store, mailer.clone(), Some(KEY));

        let fire_at = Utc::now() + Duration::seconds(300);
        let ctx = ExecutionContext::new(Uuid::new_v4(), "mail").with_user(Some(user_id));
        let outcome = executor
            .execute(&email_config(true, Some(fire_at)), &ctx)
            .await
            .unwrap();

        match outcome {
            ExecutorOutcome::Scheduled(draft) => {
                assert_eq!(draft.node_id, "mail");
                assert_eq!(draft.fire_at, fire_at);
            }
            other => panic!("expected deferred draft, got {:?}", other),
        }
        assert!(mailer.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_near_future_sends_immediately() {
        let user_id = Uuid::new_v4();
        let store = store_with_credentials(user_id).await;
        let mailer = Arc::new(RecordingMailer::default());
        let executor = EmailExecutor::new(store, mailer.clone(), Some(KEY));

        // Inside the 10 s horizon: no deferral.
        let fire_at = Utc::now() + Duration::seconds(5);
        let ctx = ExecutionContext::new(Uuid::new_v4(), "mail").with_user(Some(user_id));
        let outcome = executor
            .execute(&email_config(true, Some(fire_at)), &ctx)
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutorOutcome::Success(_)));
        assert_eq!(mailer.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_config_error() {
        let store = Arc::new(InMemoryStateStore::new());
        let mailer = Arc::new(RecordingMailer::default());
        let executor = EmailExecutor::new(store, mailer, Some(KEY));

        let ctx = ExecutionContext::new(Uuid::new_v4(), "mail").with_user(Some(Uuid::new_v4()));
        let err = executor
            .execute(&email_config(false, None), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigMissing);
    }
}
