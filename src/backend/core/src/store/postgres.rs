//! PostgreSQL state store.
//!
//! Task records live in their own table so concurrent workers append
//! with plain inserts; the run row never carries the list. Patches
//! target the latest record for a node via a correlated subquery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DeferredEmail, DeferredEmailStatus, SmtpCredentials, StateStore, WorkerRecord, WorkerStatus};
use crate::dag::{Dag, NodeId};
use crate::error::{CascadeError, ErrorCode, Result};
use crate::run::{Run, RunStatus, TaskRecord, TaskRecordPatch, TaskStatus, Timeline};

#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Create a new connection pool against the state store.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                CascadeError::with_internal(
                    ErrorCode::DatabaseError,
                    "Migration failed",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_task_records(&self, run_id: Uuid) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT node_id, display_name, status, attempts, started_at, completed_at, output, error
            FROM task_records
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            records.push(TaskRecord {
                node_id: NodeId::new(row.try_get::<String, _>("node_id")?),
                display_name: row.try_get("display_name")?,
                status: TaskStatus::parse(&status).ok_or_else(|| {
                    CascadeError::internal(format!("Unknown task status in store: {}", status))
                })?,
                attempts: row.try_get::<i32, _>("attempts")? as u32,
                started_at: row.try_get("started_at")?,
                completed_at: row.try_get("completed_at")?,
                output: row.try_get("output")?,
                error: row.try_get("error")?,
            });
        }
        Ok(records)
    }

    fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<Run> {
        let status: String = row.try_get("status")?;
        Ok(Run {
            id: row.try_get("id")?,
            dag_id: row.try_get("dag_id")?,
            owner: row.try_get("owner")?,
            status: RunStatus::parse(&status).ok_or_else(|| {
                CascadeError::internal(format!("Unknown run status in store: {}", status))
            })?,
            timeline: Timeline {
                queued_at: row.try_get("queued_at")?,
                started_at: row.try_get("started_at")?,
                completed_at: row.try_get("completed_at")?,
            },
            task_records: Vec::new(),
            triggered_by: row.try_get("triggered_by")?,
            failure_reason: row.try_get("failure_reason")?,
        })
    }

    async fn hydrate_run(&self, mut run: Run) -> Result<Run> {
        run.task_records = self.load_task_records(run.id).await?;
        Ok(run)
    }

    fn dag_from_row(row: &sqlx::postgres::PgRow) -> Result<Dag> {
        let definition: serde_json::Value = row.try_get("definition")?;
        Ok(serde_json::from_value(definition)?)
    }

    fn deferred_from_row(row: &sqlx::postgres::PgRow) -> Result<DeferredEmail> {
        let status: String = row.try_get("status")?;
        Ok(DeferredEmail {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            node_id: row.try_get("node_id")?,
            sender_user_id: row.try_get("sender_user_id")?,
            recipient: row.try_get("recipient")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            fire_at: row.try_get("fire_at")?,
            status: DeferredEmailStatus::parse(&status).ok_or_else(|| {
                CascadeError::internal(format!("Unknown deferred email status: {}", status))
            })?,
            sent_at: row.try_get("sent_at")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    // ─── DAGs ────────────────────────────────────────────────────────────────

    async fn insert_dag(&self, dag: &Dag) -> Result<()> {
        let (token, path) = match &dag.trigger {
            Some(t) => (Some(t.token.clone()), t.path.clone()),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO dags (id, owner, name, active, trigger_token, trigger_path, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                active = EXCLUDED.active,
                trigger_token = EXCLUDED.trigger_token,
                trigger_path = EXCLUDED.trigger_path,
                definition = EXCLUDED.definition,
                updated_at = NOW()
            "#,
        )
        .bind(dag.id)
        .bind(dag.owner)
        .bind(&dag.name)
        .bind(dag.active)
        .bind(token)
        .bind(path)
        .bind(serde_json::to_value(dag)?)
        .bind(dag.created_at)
        .bind(dag.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_dag(&self, id: Uuid) -> Result<Option<Dag>> {
        let row = sqlx::query("SELECT definition FROM dags WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::dag_from_row(&r)).transpose()
    }

    async fn delete_dag(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dags WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_dags(&self) -> Result<Vec<Dag>> {
        let rows = sqlx::query("SELECT definition FROM dags WHERE active ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::dag_from_row).collect()
    }

    async fn find_dag_by_trigger_token(&self, token: &str) -> Result<Option<Dag>> {
        let row = sqlx::query("SELECT definition FROM dags WHERE trigger_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::dag_from_row(&r)).transpose()
    }

    async fn find_dag_by_trigger_path(&self, path: &str) -> Result<Option<Dag>> {
        let row = sqlx::query("SELECT definition FROM dags WHERE trigger_path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::dag_from_row(&r)).transpose()
    }

    // ─── Runs ────────────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, dag_id, owner, status, triggered_by, queued_at, started_at, completed_at, failure_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.dag_id)
        .bind(run.owner)
        .bind(run.status.as_str())
        .bind(&run.triggered_by)
        .bind(run.timeline.queued_at)
        .bind(run.timeline.started_at)
        .bind(run.timeline.completed_at)
        .bind(&run.failure_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT id, dag_id, owner, status, triggered_by, queued_at, started_at, completed_at, failure_reason
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let run = Self::run_from_row(&row)?;
                Ok(Some(self.hydrate_run(run).await?))
            }
            None => Ok(None),
        }
    }

    async fn list_recent_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT id, dag_id, owner, status, triggered_by, queued_at, started_at, completed_at, failure_reason
            FROM runs
            ORDER BY queued_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let runs = rows
            .iter()
            .map(Self::run_from_row)
            .collect::<Result<Vec<_>>>()?;
        futures::future::try_join_all(runs.into_iter().map(|run| self.hydrate_run(run))).await
    }

    async fn list_stale_runs(&self, queued_before: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT id, dag_id, owner, status, triggered_by, queued_at, started_at, completed_at, failure_reason
            FROM runs
            WHERE status IN ('queued', 'running') AND queued_at <= $1
            ORDER BY queued_at
            "#,
        )
        .bind(queued_before)
        .fetch_all(&self.pool)
        .await?;

        let runs = rows
            .iter()
            .map(Self::run_from_row)
            .collect::<Result<Vec<_>>>()?;
        futures::future::try_join_all(runs.into_iter().map(|run| self.hydrate_run(run))).await
    }

    async fn set_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = $2,
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(started_at)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_run(&self, id: Uuid, reason: &str, completed_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed', failure_reason = $2, completed_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_task_record(&self, run_id: Uuid, record: &TaskRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_records
                (run_id, node_id, display_name, status, attempts, started_at, completed_at, output, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run_id)
        .bind(record.node_id.as_str())
        .bind(&record.display_name)
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.output)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_task_record(
        &self,
        run_id: Uuid,
        node_id: &str,
        patch: TaskRecordPatch,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_records
            SET status = COALESCE($3, status),
                completed_at = COALESCE($4, completed_at),
                output = COALESCE($5, output),
                error = COALESCE($6, error)
            WHERE id = (
                SELECT id FROM task_records
                WHERE run_id = $1 AND node_id = $2
                ORDER BY id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(run_id)
        .bind(node_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.completed_at)
        .bind(patch.output)
        .bind(patch.error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_open_records(&self, run_id: Uuid, error: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE task_records
            SET status = 'failed', error = $2, completed_at = NOW()
            WHERE run_id = $1 AND status IN ('running', 'retrying', 'scheduled')
            "#,
        )
        .bind(run_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ─── Workers ─────────────────────────────────────────────────────────────

    async fn upsert_worker(&self, worker: &WorkerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers
                (worker_id, status, last_heartbeat, started_at, cpu_load, memory_mb,
                 tasks_in_progress, tasks_completed, tasks_failed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (worker_id) DO UPDATE SET
                status = EXCLUDED.status,
                last_heartbeat = EXCLUDED.last_heartbeat,
                cpu_load = EXCLUDED.cpu_load,
                memory_mb = EXCLUDED.memory_mb,
                tasks_in_progress = EXCLUDED.tasks_in_progress,
                tasks_completed = EXCLUDED.tasks_completed,
                tasks_failed = EXCLUDED.tasks_failed
            "#,
        )
        .bind(&worker.worker_id)
        .bind(worker.status.as_str())
        .bind(worker.last_heartbeat)
        .bind(worker.started_at)
        .bind(worker.cpu_load)
        .bind(worker.memory_mb as i64)
        .bind(worker.tasks_in_progress as i32)
        .bind(worker.tasks_completed as i64)
        .bind(worker.tasks_failed as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, status, last_heartbeat, started_at, cpu_load, memory_mb,
                   tasks_in_progress, tasks_completed, tasks_failed
            FROM workers
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workers = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            workers.push(WorkerRecord {
                worker_id: row.try_get("worker_id")?,
                status: WorkerStatus::parse(&status).ok_or_else(|| {
                    CascadeError::internal(format!("Unknown worker status: {}", status))
                })?,
                last_heartbeat: row.try_get("last_heartbeat")?,
                started_at: row.try_get("started_at")?,
                cpu_load: row.try_get("cpu_load")?,
                memory_mb: row.try_get::<i64, _>("memory_mb")? as u64,
                tasks_in_progress: row.try_get::<i32, _>("tasks_in_progress")? as u32,
                tasks_completed: row.try_get::<i64, _>("tasks_completed")? as u64,
                tasks_failed: row.try_get::<i64, _>("tasks_failed")? as u64,
            });
        }
        Ok(workers)
    }

    async fn mark_workers_offline(&self, heartbeat_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'offline'
            WHERE last_heartbeat < $1 AND status NOT IN ('offline', 'draining')
            "#,
        )
        .bind(heartbeat_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ─── Deferred emails ─────────────────────────────────────────────────────

    async fn insert_deferred_email(&self, email: &DeferredEmail) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deferred_emails
                (id, run_id, node_id, sender_user_id, recipient, subject, body,
                 fire_at, status, sent_at, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(email.id)
        .bind(email.run_id)
        .bind(&email.node_id)
        .bind(email.sender_user_id)
        .bind(&email.recipient)
        .bind(&email.subject)
        .bind(&email.body)
        .bind(email.fire_at)
        .bind(email.status.as_str())
        .bind(email.sent_at)
        .bind(&email.error)
        .bind(email.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due_deferred_emails(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DeferredEmail>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, node_id, sender_user_id, recipient, subject, body,
                   fire_at, status, sent_at, error, created_at
            FROM deferred_emails
            WHERE status = 'pending' AND fire_at >= $1 AND fire_at <= $2
            ORDER BY fire_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::deferred_from_row).collect()
    }

    async fn claim_deferred_email(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deferred_emails
            SET status = 'sent', sent_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_deferred_email(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deferred_emails
            SET status = 'failed', sent_at = NULL, error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_deferred_for_run(&self, run_id: Uuid) -> Result<Vec<DeferredEmail>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, node_id, sender_user_id, recipient, subject, body,
                   fire_at, status, sent_at, error, created_at
            FROM deferred_emails
            WHERE run_id = $1 AND status = 'pending'
            ORDER BY fire_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::deferred_from_row).collect()
    }

    async fn cancel_pending_deferred_for_run(&self, run_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE deferred_emails
            SET status = 'cancelled'
            WHERE run_id = $1 AND status = 'pending'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ─── SMTP credentials ────────────────────────────────────────────────────

    async fn get_smtp_credentials(&self, user_id: Uuid) -> Result<Option<SmtpCredentials>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, host, port, username, encrypted_password, from_address
            FROM smtp_credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(SmtpCredentials {
                user_id: row.try_get("user_id")?,
                host: row.try_get("host")?,
                port: row.try_get::<i32, _>("port")? as u16,
                username: row.try_get("username")?,
                encrypted_password: row.try_get("encrypted_password")?,
                from_address: row.try_get("from_address")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_smtp_credentials(&self, credentials: &SmtpCredentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO smtp_credentials (user_id, host, port, username, encrypted_password, from_address)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                username = EXCLUDED.username,
                encrypted_password = EXCLUDED.encrypted_password,
                from_address = EXCLUDED.from_address
            "#,
        )
        .bind(credentials.user_id)
        .bind(&credentials.host)
        .bind(credentials.port as i32)
        .bind(&credentials.username)
        .bind(&credentials.encrypted_password)
        .bind(&credentials.from_address)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ─── Health ──────────────────────────────────────────────────────────────

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
