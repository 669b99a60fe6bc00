//! # Cascade Core
//!
//! A workflow orchestration engine for internal automation: users define
//! DAGs of heterogeneous tasks (HTTP calls, emails, database queries,
//! scripts, file operations, webhooks, delays, notifications,
//! transforms) and Cascade executes them with per-DAG retry policy,
//! cron/interval scheduling, webhook triggering, and at-least-once
//! dispatch through a shared queue consumed by stateless workers.
//!
//! ## Architecture
//!
//! - **Queue**: Redis-backed FIFO task list with a dead-letter sibling
//! - **Store**: Postgres-backed durable home of DAGs, runs, workers,
//!   and deferred emails, behind the `StateStore` trait
//! - **Executors**: one implementation per task kind, in a registry
//! - **Worker**: dequeue → execute → persist → emit → enqueue successors
//! - **Dispatcher**: frontier computation and dependency-driven enqueue
//! - **Scheduler**: cron/interval timers reconciled from DAG schedules
//! - **Monitors**: deferred email handler, auto-fail, worker health
//!
//! Dispatch is **at-least-once**: tasks may execute more than once under
//! adversarial timing, so prefer idempotent task configurations.

pub mod api;
pub mod config;
pub mod crypto;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executors;
pub mod monitors;
pub mod queue;
pub mod run;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{CascadeError, ErrorCode, ErrorContext, ErrorSeverity, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::dag::{
        Dag, DagGraph, DagSchedule, Edge, Node, NodeConfig, NodeId, RetryPolicy, Schedule,
        TriggerConfig,
    };
    pub use crate::dispatch::Dispatcher;
    pub use crate::error::{CascadeError, ErrorCode, ErrorContext, Result};
    pub use crate::events::{BroadcastEventBus, EventSink, ExecutionEvent, RedisEventBus};
    pub use crate::executors::{
        ExecutionContext, Executor, ExecutorDeps, ExecutorOutcome, ExecutorRegistry, Mailer,
        SmtpMailer,
    };
    pub use crate::monitors::{AutoFailMonitor, DeferredEmailHandler, WorkerHealthMonitor};
    pub use crate::queue::{QueueBackend, TaskMessage, TaskQueue};
    pub use crate::run::{Run, RunStatus, TaskRecord, TaskStatus};
    pub use crate::scheduler::RunScheduler;
    pub use crate::store::{
        DeferredEmail, InMemoryStateStore, PostgresStateStore, StateStore, WorkerRecord,
        WorkerStatus,
    };
    pub use crate::worker::TaskWorker;
}
