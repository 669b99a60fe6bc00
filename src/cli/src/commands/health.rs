//! Server health check.

use anyhow::Result;
use clap::Args;
use serde::Deserialize;

use crate::client::ApiClient;
use crate::output;

#[derive(Args)]
pub struct HealthArgs {}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
    store: bool,
    queue: bool,
}

pub async fn handle(_args: HealthArgs, client: &ApiClient) -> Result<()> {
    let health: HealthResponse = client.get("/healthz").await?;

    if health.healthy {
        output::print_success("Server healthy");
    } else {
        output::print_error("Server degraded");
    }
    println!("  store: {}", if health.store { "ok" } else { "down" });
    println!("  queue: {}", if health.queue { "ok" } else { "down" });

    if !health.healthy {
        std::process::exit(1);
    }
    Ok(())
}
