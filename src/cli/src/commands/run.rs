//! Run inspection and cancellation commands.

use anyhow::Result;
use clap::Subcommand;
use serde::Deserialize;
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum RunCommands {
    /// List recent runs
    List {
        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show one run with its task records
    Status {
        /// Run ID
        run_id: Uuid,
    },

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: Uuid,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    id: Uuid,
    dag_id: Uuid,
    status: String,
    triggered_by: String,
    timeline: TimelineResponse,
    #[serde(default)]
    task_records: Vec<TaskRecordResponse>,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineResponse {
    queued_at: chrono::DateTime<chrono::Utc>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecordResponse {
    node_id: String,
    display_name: String,
    status: String,
    attempts: u32,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Tabled, serde::Serialize)]
struct RunRow {
    id: String,
    dag: String,
    status: String,
    triggered_by: String,
    queued_at: String,
    completed_at: String,
}

#[derive(Tabled, serde::Serialize)]
struct TaskRow {
    node: String,
    name: String,
    status: String,
    attempts: u32,
    error: String,
}

pub async fn handle(command: RunCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match command {
        RunCommands::List { limit } => {
            let runs: Vec<RunResponse> =
                client.get(&format!("/api/runs?limit={}", limit)).await?;
            let rows: Vec<RunRow> = runs.iter().map(run_row).collect();
            output::print_list(&rows, format);
        }
        RunCommands::Status { run_id } => {
            let run: RunResponse = client.get(&format!("/api/runs/{}", run_id)).await?;
            match format {
                OutputFormat::Json => output::print_json(&serde_json::json!({
                    "id": run.id,
                    "dag_id": run.dag_id,
                    "status": run.status,
                    "failure_reason": run.failure_reason,
                })),
                OutputFormat::Table => {
                    output::print_info(&format!(
                        "Run {} ({}) is {}",
                        run.id,
                        run.triggered_by,
                        output::colored_status(&run.status)
                    ));
                    if let Some(reason) = &run.failure_reason {
                        output::print_error(&format!("Failure reason: {}", reason));
                    }
                    let rows: Vec<TaskRow> = run
                        .task_records
                        .iter()
                        .map(|r| TaskRow {
                            node: r.node_id.clone(),
                            name: r.display_name.clone(),
                            status: r.status.clone(),
                            attempts: r.attempts,
                            error: r.error.clone().unwrap_or_default(),
                        })
                        .collect();
                    output::print_list(&rows, format);
                }
            }
        }
        RunCommands::Cancel { run_id } => {
            let run: RunResponse = client.post(&format!("/api/runs/{}/cancel", run_id)).await?;
            output::print_success(&format!("Run {} cancelled ({})", run.id, run.status));
        }
    }
    Ok(())
}

fn run_row(run: &RunResponse) -> RunRow {
    RunRow {
        id: run.id.to_string(),
        dag: run.dag_id.to_string(),
        status: run.status.clone(),
        triggered_by: run.triggered_by.clone(),
        queued_at: run.timeline.queued_at.to_rfc3339(),
        completed_at: run
            .timeline
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    }
}
