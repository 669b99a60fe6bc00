//! Structured logging initialization.
//!
//! JSON format for production, pretty format for development, with
//! per-module filtering through `RUST_LOG` / the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; subsequent calls are ignored so tests
/// can share a process.
pub fn init(service: &str, cfg: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if cfg.json_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    match result {
        Ok(()) => tracing::info!(service, "Telemetry initialized"),
        Err(_) => tracing::debug!(service, "Telemetry already initialized"),
    }
}
