//! Task executors: one pure function per task kind.
//!
//! An executor maps `(config, context) → output | error` and never
//! mutates the state store; persistence is the worker's job. The email
//! executor signals a deferred send by returning a [`ExecutorOutcome::Scheduled`]
//! draft that the worker persists.

mod database;
mod delay;
mod email;
mod file;
mod http;
mod notification;
mod script;
mod transform;
mod webhook;

pub use database::DatabaseExecutor;
pub use delay::DelayExecutor;
pub use email::testing as testing_mailer;
pub use email::{EmailExecutor, Mailer, OutgoingEmail, SmtpAccount, SmtpMailer};
pub(crate) use email::resolve_account;
pub use file::FileExecutor;
pub use http::HttpExecutor;
pub use notification::NotificationExecutor;
pub use script::ScriptExecutor;
pub use transform::TransformExecutor;
pub use webhook::WebhookExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::dag::NodeConfig;
use crate::error::{CascadeError, ErrorCode, Result};
use crate::store::{DeferredEmail, StateStore};

/// Context handed to an executor for one task attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub node_id: String,

    /// Resolved identity of the owning user, for credential lookup
    pub user_id: Option<Uuid>,

    /// Output of the predecessor node(s): the single predecessor's output,
    /// or an object keyed by node id when there are several
    pub input: serde_json::Value,

    /// 1-indexed attempt number
    pub attempt: u32,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            user_id: None,
            input: serde_json::Value::Null,
            attempt: 1,
        }
    }

    pub fn with_user(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// What an executor produced.
#[derive(Debug)]
pub enum ExecutorOutcome {
    /// The task completed; the value becomes the task record's output.
    Success(serde_json::Value),

    /// The node enters the `scheduled` state: the worker persists this
    /// draft and the run stays open until the deferred send fires.
    Scheduled(DeferredEmail),
}

/// A task executor for one kind.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The kind string this executor handles.
    fn kind(&self) -> &'static str;

    /// Execute one task attempt.
    async fn execute(&self, config: &NodeConfig, ctx: &ExecutionContext)
        -> Result<ExecutorOutcome>;
}

impl std::fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Executor({})", self.kind())
    }
}

/// Returned when a config variant reaches the wrong executor; indicates a
/// registry wiring bug, not user error.
pub(crate) fn config_mismatch(kind: &str) -> CascadeError {
    CascadeError::internal(format!("Config variant does not match executor kind {}", kind))
}

/// Shared dependencies the standard executor set needs.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub http: reqwest::Client,
    pub store: Arc<dyn StateStore>,
    pub mailer: Arc<dyn Mailer>,
    pub encryption_key: Option<[u8; 32]>,
    pub default_db_url: Option<String>,
    pub script_dir: Option<String>,
}

/// Registry of executors keyed by kind string.
///
/// Adding a task kind is a localized change: implement [`Executor`] and
/// register it here.
pub struct ExecutorRegistry {
    by_kind: HashMap<&'static str, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            by_kind: HashMap::new(),
        }
    }

    /// The full standard set of executors.
    pub fn standard(deps: ExecutorDeps) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(HttpExecutor::new(deps.http.clone())));
        registry.register(Arc::new(EmailExecutor::new(
            deps.store.clone(),
            deps.mailer.clone(),
            deps.encryption_key,
        )));
        registry.register(Arc::new(DatabaseExecutor::new(deps.default_db_url.clone())));
        registry.register(Arc::new(ScriptExecutor::new(deps.script_dir.clone())));
        registry.register(Arc::new(FileExecutor::new()));
        registry.register(Arc::new(WebhookExecutor::new(deps.http.clone())));
        registry.register(Arc::new(DelayExecutor::new()));
        registry.register(Arc::new(NotificationExecutor::new(deps.http)));
        registry.register(Arc::new(TransformExecutor::new()));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.by_kind.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Executor>> {
        self.by_kind.get(kind).cloned().ok_or_else(|| {
            CascadeError::new(
                ErrorCode::UnknownTaskKind,
                format!("No executor registered for kind: {}", kind),
            )
        })
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.by_kind.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;

    #[test]
    fn test_standard_registry_covers_every_kind() {
        let deps = ExecutorDeps {
            http: reqwest::Client::new(),
            store: Arc::new(InMemoryStateStore::new()),
            mailer: Arc::new(testing_mailer::RecordingMailer::default()),
            encryption_key: None,
            default_db_url: None,
            script_dir: None,
        };
        let registry = ExecutorRegistry::standard(deps);
        assert_eq!(
            registry.kinds(),
            vec![
                "database",
                "delay",
                "email",
                "file",
                "http",
                "notification",
                "script",
                "transform",
                "webhook",
            ]
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let registry = ExecutorRegistry::empty();
        let err = registry.get("teleport").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownTaskKind);
    }
}
