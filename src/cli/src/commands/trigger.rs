//! Trigger commands: fire a DAG manually or through its trigger token.

use anyhow::Result;
use clap::Subcommand;
use serde::Deserialize;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output;

#[derive(Subcommand)]
pub enum TriggerCommands {
    /// Trigger a DAG by id (manual trigger)
    Dag {
        /// DAG ID
        dag_id: Uuid,
    },

    /// Fire a trigger token (as the webhook would)
    Token {
        /// Trigger token
        token: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    triggered: bool,
    run_id: Option<Uuid>,
    status: Option<String>,
}

pub async fn handle(command: TriggerCommands, client: &ApiClient) -> Result<()> {
    let response: TriggerResponse = match command {
        TriggerCommands::Dag { dag_id } => {
            client.post(&format!("/api/dags/{}/trigger", dag_id)).await?
        }
        TriggerCommands::Token { token } => {
            client.post(&format!("/api/triggers/{}", token)).await?
        }
    };

    if response.triggered {
        output::print_success(&format!(
            "Run {} created ({})",
            response
                .run_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            response.status.unwrap_or_default()
        ));
    } else {
        output::print_info("Trigger skipped: DAG inactive or outside its schedule window");
    }
    Ok(())
}
