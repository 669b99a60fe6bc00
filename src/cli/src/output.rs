//! Output formatting utilities for the Cascade CLI.

use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
}

/// Print a success message to stdout.
pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

/// Print an informational message to stdout.
pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

/// Print a list of items in the requested format.
pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No results found.".dimmed());
                return;
            }
            let table = Table::new(items)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(items).expect("serialize to JSON");
            println!("{}", json);
        }
    }
}

/// Print a single serializable value as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) {
    let json = serde_json::to_string_pretty(value).expect("serialize to JSON");
    println!("{}", json);
}

/// Colorize a run or task status string.
pub fn colored_status(status: &str) -> ColoredString {
    match status {
        "success" | "sent" | "idle" | "active" => status.green(),
        "running" | "busy" | "queued" | "scheduled" => status.yellow(),
        "failed" | "offline" => status.red(),
        "cancelled" | "draining" | "retrying" => status.magenta(),
        other => other.normal(),
    }
}
