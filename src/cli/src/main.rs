//! Cascade CLI - command-line interface for operating Cascade.
//!
//! Provides trigger, run, worker, dead-letter, and health commands
//! against a running Cascade server.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{deadletter, health, run, trigger, worker};
use output::OutputFormat;

/// Cascade - DAG workflow orchestration CLI
#[derive(Parser)]
#[command(
    name = "cascade",
    version = "0.1.0",
    about = "Cascade - DAG workflow orchestration engine",
    long_about = "CLI tool for triggering Cascade workflows and inspecting runs, workers, and the dead-letter queue.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Server URL
    #[arg(long, global = true, env = "CASCADE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger a DAG
    #[command(subcommand)]
    Trigger(trigger::TriggerCommands),

    /// Run inspection and cancellation
    #[command(subcommand)]
    Run(run::RunCommands),

    /// List workers and their heartbeats
    Workers(worker::WorkerArgs),

    /// Inspect the dead-letter queue
    DeadLetters(deadletter::DeadLetterArgs),

    /// Check server health
    Health(health::HealthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    match cli.command {
        Commands::Trigger(command) => trigger::handle(command, &client).await,
        Commands::Run(command) => run::handle(command, &client, format).await,
        Commands::Workers(args) => worker::handle(args, &client, format).await,
        Commands::DeadLetters(args) => deadletter::handle(args, &client, format).await,
        Commands::Health(args) => health::handle(args, &client).await,
    }
}
