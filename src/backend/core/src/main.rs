//! Cascade Server - main entry point.
//!
//! Hosts the trigger endpoint and operator surface, plus the periodic
//! tasks that live in the server process: the scheduler, the deferred
//! email handler, the auto-fail monitor, and the worker health monitor.
//! Workers run separately (see `cascade-worker`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cascade_core::api::{self, AppState};
use cascade_core::config::Config;
use cascade_core::dispatch::Dispatcher;
use cascade_core::events::RedisEventBus;
use cascade_core::executors::SmtpMailer;
use cascade_core::monitors::{AutoFailMonitor, DeferredEmailHandler, WorkerHealthMonitor};
use cascade_core::queue::{RedisQueueBackend, TaskQueue};
use cascade_core::scheduler::RunScheduler;
use cascade_core::store::PostgresStateStore;
use cascade_core::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: could not load config: {}. Using defaults.", e);
        let mut config = Config::default();
        if let Ok(url) = std::env::var("STATE_STORE_URL") {
            config.database.url = url;
        }
        if let Ok(url) = std::env::var("QUEUE_URL") {
            config.queue.url = url;
        }
        config
    });

    telemetry::init("cascade-server", &config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Cascade Server");

    // State store.
    let store = Arc::new(
        PostgresStateStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    store.migrate().await?;
    tracing::info!("Connected to state store (migrations applied)");

    // Queue and event channel over Redis.
    let redis_client = redis::Client::open(config.queue.connection_url().as_str())?;
    let queue = TaskQueue::new(Arc::new(RedisQueueBackend::new(
        redis_client.clone(),
        config.queue.key.clone(),
    )));
    let events = Arc::new(RedisEventBus::new(
        redis_client.clone(),
        config.events.channel.clone(),
    ));
    tracing::info!(queue = %config.queue.key, "Queue client ready");

    let store_dyn: Arc<dyn cascade_core::store::StateStore> = store.clone();
    let dispatcher = Dispatcher::new(store_dyn.clone(), queue.clone(), events.clone());

    // Periodic tasks. Not leader-elected: run one server instance if
    // duplicate schedule firings are unacceptable.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let encryption_key = config.security.encryption_key_bytes().ok();
    if encryption_key.is_none() {
        tracing::warn!("ENCRYPTION_KEY not configured; email sends will fail");
    }

    let scheduler = Arc::new(RunScheduler::new(store_dyn.clone(), dispatcher.clone()));
    tokio::spawn(scheduler.clone().run(
        Duration::from_secs(config.scheduler.reconcile_secs),
        shutdown_rx.clone(),
    ));

    let deferred = Arc::new(DeferredEmailHandler::new(
        store_dyn.clone(),
        events.clone(),
        dispatcher.clone(),
        Arc::new(SmtpMailer),
        encryption_key,
    ));
    tokio::spawn(deferred.run(
        Duration::from_secs(config.scheduler.deferred_sweep_secs),
        shutdown_rx.clone(),
    ));

    let auto_fail = Arc::new(AutoFailMonitor::new(
        store_dyn.clone(),
        events.clone(),
        config.scheduler.run_max_age_minutes,
        config.scheduler.deferred_grace_minutes,
    ));
    tokio::spawn(auto_fail.run(
        Duration::from_secs(config.scheduler.auto_fail_sweep_secs),
        shutdown_rx.clone(),
    ));

    let worker_health = Arc::new(WorkerHealthMonitor::new(
        store_dyn.clone(),
        config.scheduler.heartbeat_timeout_secs,
    ));
    tokio::spawn(worker_health.run(
        Duration::from_secs(config.scheduler.health_sweep_secs),
        shutdown_rx,
    ));

    tracing::info!("Scheduler and monitors started");

    // HTTP surface.
    let app_state = AppState {
        store: store_dyn,
        queue,
        dispatcher,
        redis: Some(redis_client),
    };
    let app = api::build_router(app_state, config.server.frontend_origin.as_deref());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
