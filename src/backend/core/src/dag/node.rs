//! Node definitions and per-kind task configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a node, unique within its graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Retry behavior for task execution. Backoff is a fixed delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum execution attempts (≥ 1; the first attempt counts)
    pub max_attempts: u32,
    /// Fixed delay between attempts, milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("retry_policy.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// One step inside a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Identifier, unique within the graph
    pub id: NodeId,

    /// Human-readable name shown in run records and events
    #[serde(default)]
    pub display_name: String,

    /// Task kind and its configuration
    #[serde(flatten)]
    pub config: NodeConfig,

    /// Node-level retry override (the DAG-level policy wins when both are set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Node {
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Self {
        let id = NodeId::new(id);
        Self {
            display_name: id.0.clone(),
            id,
            config,
            retry: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.config.kind()
    }
}

/// Per-kind task configuration, discriminated by `kind`.
///
/// Parsed once at DAG write time; unknown kinds fail deserialization
/// instead of surfacing inside a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeConfig {
    Http(HttpTaskConfig),
    Email(EmailTaskConfig),
    Database(DatabaseTaskConfig),
    Script(ScriptTaskConfig),
    File(FileTaskConfig),
    Webhook(WebhookTaskConfig),
    Delay(DelayTaskConfig),
    Notification(NotificationTaskConfig),
    Transform(TransformTaskConfig),
}

impl NodeConfig {
    /// The kind string used by the executor registry and the wire format.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Email(_) => "email",
            Self::Database(_) => "database",
            Self::Script(_) => "script",
            Self::File(_) => "file",
            Self::Webhook(_) => "webhook",
            Self::Delay(_) => "delay",
            Self::Notification(_) => "notification",
            Self::Transform(_) => "transform",
        }
    }

    /// Task timeout requested by the configuration, if any.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Self::Http(c) => c.timeout_ms,
            Self::Script(c) => c.timeout_ms,
            Self::Delay(c) => Some(c.duration_ms.saturating_add(1000)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTaskConfig {
    pub url: String,

    #[serde(default = "default_http_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub query: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// Clamped to [1_000, 300_000] at execution time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTaskConfig {
    pub to: String,
    pub subject: String,
    pub body: String,

    /// When true with a future `fire_at`, the send is deferred and the
    /// node enters the `scheduled` state.
    #[serde(default)]
    pub scheduled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseOperation {
    Insert,
    Find,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseTaskConfig {
    /// Optional connection string; the worker's default store is reused
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    pub operation: DatabaseOperation,

    /// Target table name
    pub table: String,

    /// Document for insert/update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,

    /// Containment filter for find/update/delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,

    #[serde(default = "default_find_limit")]
    pub limit: i64,
}

fn default_find_limit() -> i64 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Node,
    Python,
    Bash,
}

impl ScriptLanguage {
    pub fn interpreter(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python3",
            Self::Bash => "bash",
        }
    }

    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Node => ".js",
            Self::Python => ".py",
            Self::Bash => ".sh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTaskConfig {
    pub language: ScriptLanguage,

    /// Script body written to a scratch file
    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Append,
    Delete,
    Copy,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTaskConfig {
    pub operation: FileOperation,
    pub path: String,

    /// Content for write/append
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Destination for copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTaskConfig {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Shared secret for HMAC-SHA256 signing of the serialized payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    #[serde(default = "default_signature_header")]
    pub signature_header: String,
}

fn default_signature_header() -> String {
    "X-Cascade-Signature".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayTaskConfig {
    /// Clamped to [0, 3_600_000] at execution time
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPlatform {
    Slack,
    Discord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTaskConfig {
    pub platform: NotificationPlatform,
    pub webhook_url: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformTaskConfig {
    /// Expression evaluated over the prior-node output (`input`)
    pub expression: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_json_shape() {
        let node = Node::new(
            "fetch",
            NodeConfig::Http(HttpTaskConfig {
                url: "https://example.com/api".to_string(),
                method: "GET".to_string(),
                headers: HashMap::new(),
                query: HashMap::new(),
                body: None,
                timeout_ms: None,
            }),
        );
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["id"], "fetch");
        assert_eq!(json["kind"], "http");
        assert_eq!(json["config"]["url"], "https://example.com/api");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let raw = serde_json::json!({
            "id": "x",
            "kind": "teleport",
            "config": {}
        });
        assert!(serde_json::from_value::<Node>(raw).is_err());
    }

    #[test]
    fn test_retry_policy_validation() {
        assert!(RetryPolicy { max_attempts: 0, backoff_ms: 0 }.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_script_language_interpreters() {
        assert_eq!(ScriptLanguage::Node.interpreter(), "node");
        assert_eq!(ScriptLanguage::Python.file_suffix(), ".py");
    }
}
