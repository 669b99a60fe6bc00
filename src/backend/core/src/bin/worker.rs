//! Cascade Worker - stateless task execution process.
//!
//! Pops task messages from the shared queue, executes them through the
//! executor registry, and records outcomes in the state store. Run as
//! many instances as the workload needs; any worker may execute any
//! task.

use std::sync::Arc;
use std::time::Duration;

use cascade_core::config::Config;
use cascade_core::events::RedisEventBus;
use cascade_core::executors::{ExecutorDeps, ExecutorRegistry, SmtpMailer};
use cascade_core::queue::{RedisQueueBackend, TaskQueue};
use cascade_core::store::PostgresStateStore;
use cascade_core::telemetry;
use cascade_core::worker::TaskWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: could not load config: {}. Using defaults.", e);
        Config::default()
    });

    telemetry::init("cascade-worker", &config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Cascade Worker");

    let store = Arc::new(
        PostgresStateStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    let store_dyn: Arc<dyn cascade_core::store::StateStore> = store;

    let redis_client = redis::Client::open(config.queue.connection_url().as_str())?;
    let queue = TaskQueue::new(Arc::new(RedisQueueBackend::new(
        redis_client.clone(),
        config.queue.key.clone(),
    )));
    let events = Arc::new(RedisEventBus::new(
        redis_client,
        config.events.channel.clone(),
    ));

    let encryption_key = config.security.encryption_key_bytes().ok();
    if encryption_key.is_none() {
        tracing::warn!("ENCRYPTION_KEY not configured; email tasks will fail");
    }

    let registry = Arc::new(ExecutorRegistry::standard(ExecutorDeps {
        http: reqwest::Client::new(),
        store: store_dyn.clone(),
        mailer: Arc::new(SmtpMailer),
        encryption_key,
        default_db_url: Some(config.database.url.clone()),
        script_dir: config.worker.script_dir.clone(),
    }));

    let worker = TaskWorker::new(
        store_dyn,
        queue,
        events,
        registry,
        config.worker.clone(),
        Duration::from_millis(config.queue.poll_interval_ms),
    );
    tracing::info!(worker = worker.id(), "Worker ready");

    let handle = worker.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received; draining");
    handle.shutdown().await;
    tracing::info!("Worker shutdown complete");

    Ok(())
}
