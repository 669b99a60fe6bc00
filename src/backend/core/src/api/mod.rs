//! Server HTTP surface.
//!
//! Only the execution engine's own endpoints live here: trigger entry
//! points, run inspection and cancellation, worker and dead-letter
//! visibility, and health. DAG CRUD, auth, and the builder UI belong to
//! the external API collaborator.

mod ops;
mod trigger;

use axum::http::HeaderValue;
use axum::routing::{any, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::queue::TaskQueue;
use crate::store::StateStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub queue: TaskQueue,
    pub dispatcher: Dispatcher,
    /// Present when the queue runs on Redis; used by the health probe.
    pub redis: Option<redis::Client>,
}

/// Build the server router.
pub fn build_router(state: AppState, frontend_origin: Option<&str>) -> Router {
    let cors = match frontend_origin {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::new()
                .allow_origin(value)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
            Err(_) => {
                tracing::warn!(origin, "Invalid FRONTEND_ORIGIN; CORS left closed");
                CorsLayer::new()
            }
        },
        None => CorsLayer::new(),
    };

    Router::new()
        .route("/healthz", get(ops::health))
        .route("/api/triggers/:token", any(trigger::trigger_by_token))
        .route("/api/hooks/*path", any(trigger::trigger_by_path))
        .route("/api/dags/:id/trigger", post(trigger::trigger_manual))
        .route("/api/runs", get(ops::list_runs))
        .route("/api/runs/:id", get(ops::get_run))
        .route("/api/runs/:id/cancel", post(ops::cancel_run))
        .route("/api/workers", get(ops::list_workers))
        .route("/api/queue/stats", get(ops::queue_stats))
        .route("/api/dead-letters", get(ops::list_dead_letters))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
