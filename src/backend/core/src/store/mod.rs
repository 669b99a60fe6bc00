//! State store: durable home of DAGs, Runs, Workers, and DeferredEmails.
//!
//! Everything above this layer depends on the [`StateStore`] trait, never
//! on a concrete backend, so the scheduler and workers can be exercised
//! against the in-memory implementation while production uses Postgres.
//!
//! Task records are append-safe by construction: appends are inserts into
//! their own table (or list slot), never a read-modify-write of the whole
//! run, so concurrent workers cannot truncate each other's writes.

mod memory;
mod postgres;

pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::dag::Dag;
use crate::error::Result;
use crate::run::{Run, RunStatus, TaskRecord, TaskRecordPatch};

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered, not yet polling
    Active,
    /// Polling with no task in flight
    Idle,
    /// At least one task in flight
    Busy,
    /// Graceful shutdown in progress; monitors must not reap it
    Draining,
    /// Missed heartbeats past the timeout
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "draining" => Some(Self::Draining),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Heartbeat record for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub cpu_load: f32,
    pub memory_mb: u64,
    pub tasks_in_progress: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl WorkerRecord {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Active,
            last_heartbeat: now,
            started_at: now,
            cpu_load: 0.0,
            memory_mb: 0,
            tasks_in_progress: 0,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deferred Emails
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a deferred email row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredEmailStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl DeferredEmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// An email task whose send time lies in the future. Held in the state
/// store, not on the queue; it holds the owning run open until it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredEmail {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub sender_user_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
    pub status: DeferredEmailStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl DeferredEmail {
    pub fn new(
        run_id: Uuid,
        node_id: impl Into<String>,
        sender_user_id: Uuid,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            node_id: node_id.into(),
            sender_user_id,
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            fire_at,
            status: DeferredEmailStatus::Pending,
            sent_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SMTP Credentials
// ═══════════════════════════════════════════════════════════════════════════════

/// A user's SMTP credentials; the password is AES-256-CBC ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpCredentials {
    pub user_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub encrypted_password: String,
    pub from_address: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// StateStore Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable storage behind the execution engine.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ─── DAGs ────────────────────────────────────────────────────────────────

    async fn insert_dag(&self, dag: &Dag) -> Result<()>;
    async fn get_dag(&self, id: Uuid) -> Result<Option<Dag>>;
    /// Deleting a DAG never touches its historical runs.
    async fn delete_dag(&self, id: Uuid) -> Result<bool>;
    async fn list_active_dags(&self) -> Result<Vec<Dag>>;
    async fn find_dag_by_trigger_token(&self, token: &str) -> Result<Option<Dag>>;
    async fn find_dag_by_trigger_path(&self, path: &str) -> Result<Option<Dag>>;

    // ─── Runs ────────────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;
    async fn list_recent_runs(&self, limit: i64) -> Result<Vec<Run>>;
    /// Non-terminal runs queued at or before the cutoff.
    async fn list_stale_runs(&self, queued_before: DateTime<Utc>) -> Result<Vec<Run>>;
    async fn set_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Terminate a run with a run-level failure reason.
    async fn fail_run(&self, id: Uuid, reason: &str, completed_at: DateTime<Utc>) -> Result<()>;

    /// Append one task record. Atomic with respect to concurrent appends.
    async fn append_task_record(&self, run_id: Uuid, record: &TaskRecord) -> Result<()>;

    /// Patch the latest record for a node. Returns false when no record
    /// exists for the node.
    async fn update_task_record(
        &self,
        run_id: Uuid,
        node_id: &str,
        patch: TaskRecordPatch,
    ) -> Result<bool>;

    /// Fail every non-terminal record of a run (cancellation, auto-fail).
    /// Returns the number of records changed.
    async fn fail_open_records(&self, run_id: Uuid, error: &str) -> Result<u64>;

    // ─── Workers ─────────────────────────────────────────────────────────────

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()>;
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;
    /// Mark workers silent past the cutoff as offline; draining workers
    /// are spared. Returns the number reaped.
    async fn mark_workers_offline(&self, heartbeat_before: DateTime<Utc>) -> Result<u64>;

    // ─── Deferred emails ─────────────────────────────────────────────────────

    async fn insert_deferred_email(&self, email: &DeferredEmail) -> Result<()>;
    /// Pending emails with `fire_at` inside the window, oldest first.
    async fn due_deferred_emails(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeferredEmail>>;
    /// Compare-and-set `pending → sent`; the winner sends. Returns false
    /// when another process already claimed the row.
    async fn claim_deferred_email(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool>;
    /// Record a send failure after a claim.
    async fn fail_deferred_email(&self, id: Uuid, error: &str) -> Result<()>;
    async fn pending_deferred_for_run(&self, run_id: Uuid) -> Result<Vec<DeferredEmail>>;
    /// Cancel every pending deferred email of a run (run cancellation,
    /// auto-fail): a terminal run must hold no pending rows.
    async fn cancel_pending_deferred_for_run(&self, run_id: Uuid) -> Result<u64>;

    // ─── SMTP credentials ────────────────────────────────────────────────────

    async fn get_smtp_credentials(&self, user_id: Uuid) -> Result<Option<SmtpCredentials>>;
    async fn upsert_smtp_credentials(&self, credentials: &SmtpCredentials) -> Result<()>;

    // ─── Health ──────────────────────────────────────────────────────────────

    /// Connectivity probe for the server's health endpoint.
    async fn ping(&self) -> Result<()>;
}
