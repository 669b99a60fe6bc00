//! Trigger endpoints: token, path, and manual entry points into the
//! dispatcher.

use axum::extract::{Path, State};
use axum::http::Method;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::AppState;
use crate::dag::Dag;
use crate::error::{CascadeError, ErrorCode, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Check the trigger config gates shared by token and path entry.
fn check_trigger(dag: &Dag, method: &Method) -> Result<()> {
    let trigger = dag.trigger.as_ref().ok_or_else(|| {
        CascadeError::unauthorized("DAG has no trigger configured")
    })?;

    if !trigger.enabled {
        return Err(CascadeError::new(
            ErrorCode::TriggerDisabled,
            "Trigger is disabled",
        ));
    }
    if !method.as_str().eq_ignore_ascii_case(&trigger.method) {
        return Err(CascadeError::new(
            ErrorCode::MethodNotAllowed,
            format!("Trigger accepts {} requests only", trigger.method),
        ));
    }
    Ok(())
}

async fn fire(state: &AppState, dag: Dag, triggered_by: &str) -> Result<Json<TriggerResponse>> {
    match state.dispatcher.create_run(dag.id, triggered_by).await? {
        Some(run) => Ok(Json(TriggerResponse {
            triggered: true,
            run_id: Some(run.id),
            status: Some(run.status.to_string()),
        })),
        // Inactive DAG or closed window: skipped silently.
        None => Ok(Json(TriggerResponse {
            triggered: false,
            run_id: None,
            status: None,
        })),
    }
}

/// `ANY /api/triggers/:token`
pub async fn trigger_by_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    method: Method,
) -> Result<Json<TriggerResponse>> {
    let dag = state
        .store
        .find_dag_by_trigger_token(&token)
        .await?
        .ok_or_else(|| CascadeError::unauthorized("Unknown trigger token"))?;

    check_trigger(&dag, &method)?;
    fire(&state, dag, "trigger").await
}

/// `ANY /api/hooks/*path`
pub async fn trigger_by_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
) -> Result<Json<TriggerResponse>> {
    let dag = state
        .store
        .find_dag_by_trigger_path(&path)
        .await?
        .ok_or_else(|| CascadeError::unauthorized("Unknown trigger path"))?;

    check_trigger(&dag, &method)?;
    fire(&state, dag, "trigger").await
}

/// `POST /api/dags/:id/trigger` — manual trigger by DAG id.
pub async fn trigger_manual(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TriggerResponse>> {
    let dag = state
        .store
        .get_dag(id)
        .await?
        .ok_or_else(|| CascadeError::not_found("dag", id))?;
    fire(&state, dag, "manual").await
}
