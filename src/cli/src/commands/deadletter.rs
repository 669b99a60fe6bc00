//! Dead-letter queue inspection.

use anyhow::Result;
use clap::Args;
use serde::Deserialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct DeadLetterArgs {
    /// Maximum number of entries
    #[arg(short, long, default_value = "50")]
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
struct DeadLetterListResponse {
    entries: Vec<DeadLetterEntryResponse>,
}

#[derive(Debug, Deserialize)]
struct DeadLetterEntryResponse {
    payload: String,
    reason: String,
    at: chrono::DateTime<chrono::Utc>,
}

#[derive(Tabled, serde::Serialize)]
struct DeadLetterRow {
    at: String,
    reason: String,
    payload: String,
}

pub async fn handle(args: DeadLetterArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: DeadLetterListResponse = client
        .get(&format!("/api/dead-letters?limit={}", args.limit))
        .await?;

    let rows: Vec<DeadLetterRow> = response
        .entries
        .iter()
        .map(|e| DeadLetterRow {
            at: e.at.to_rfc3339(),
            reason: e.reason.clone(),
            payload: truncate(&e.payload, 80),
        })
        .collect();

    output::print_list(&rows, format);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}…", head)
    }
}
