//! Worker fleet inspection.

use anyhow::Result;
use clap::Args;
use serde::Deserialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct WorkerArgs {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerResponse {
    worker_id: String,
    status: String,
    last_heartbeat: chrono::DateTime<chrono::Utc>,
    cpu_load: f32,
    memory_mb: u64,
    tasks_in_progress: u32,
    tasks_completed: u64,
    tasks_failed: u64,
}

#[derive(Tabled, serde::Serialize)]
struct WorkerRow {
    worker: String,
    status: String,
    heartbeat_age_s: i64,
    cpu: String,
    memory_mb: u64,
    in_progress: u32,
    completed: u64,
    failed: u64,
}

pub async fn handle(_args: WorkerArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let workers: Vec<WorkerResponse> = client.get("/api/workers").await?;
    let now = chrono::Utc::now();

    let rows: Vec<WorkerRow> = workers
        .iter()
        .map(|w| WorkerRow {
            worker: w.worker_id.clone(),
            status: w.status.clone(),
            heartbeat_age_s: (now - w.last_heartbeat).num_seconds(),
            cpu: format!("{:.1}%", w.cpu_load),
            memory_mb: w.memory_mb,
            in_progress: w.tasks_in_progress,
            completed: w.tasks_completed,
            failed: w.tasks_failed,
        })
        .collect();

    output::print_list(&rows, format);
    Ok(())
}
