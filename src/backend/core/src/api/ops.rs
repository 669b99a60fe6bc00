//! Operator read surface: runs, workers, queue, dead letters, health.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::error::{CascadeError, Result};
use crate::queue::{DeadLetterEntry, QueueStats};
use crate::run::Run;
use crate::store::WorkerRecord;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /healthz`
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let store_ok = state.store.ping().await.is_ok();
    let queue_ok = match &state.redis {
        Some(client) => async {
            let mut conn = client.get_multiplexed_async_connection().await.ok()?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .ok()
        }
        .await
        .is_some(),
        None => true,
    };

    let healthy = store_ok && queue_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "healthy": healthy,
            "store": store_ok,
            "queue": queue_ok,
        })),
    )
}

/// `GET /api/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Run>>> {
    Ok(Json(state.store.list_recent_runs(query.limit).await?))
}

/// `GET /api/runs/:id`
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>> {
    let run = state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| CascadeError::not_found("run", id))?;
    Ok(Json(run))
}

/// `POST /api/runs/:id/cancel`
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>> {
    Ok(Json(state.dispatcher.cancel_run(id).await?))
}

/// `GET /api/workers`
pub async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<WorkerRecord>>> {
    Ok(Json(state.store.list_workers().await?))
}

/// `GET /api/queue/stats`
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>> {
    Ok(Json(state.queue.stats().await?))
}

/// `GET /api/dead-letters`
#[derive(Debug, Serialize)]
pub struct DeadLetterResponse {
    pub entries: Vec<DeadLetterEntry>,
}

pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DeadLetterResponse>> {
    let entries = state.queue.dead_letters(query.limit.max(0) as usize).await?;
    Ok(Json(DeadLetterResponse { entries }))
}
