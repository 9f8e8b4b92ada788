//! CareUnity CLI - record care data offline and sync it with the API
//!
//! Changes are queued in a local store first; `sync` and `watch` push them
//! to the server and surface conflicts for review.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::filter::Directive;

use crate::cli::{Cli, Commands};
use crate::commands::cache::run_cache;
use crate::commands::common::{resolve_config_path, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::conflicts::run_conflicts;
use crate::commands::queue::run_queue;
use crate::commands::status::run_status;
use crate::commands::sync::{run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive: Directive = "careunity=info"
        .parse()
        .map_err(|error| CliError::Config(format!("invalid log directive: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Commands::Queue { command } => run_queue(command, &db_path, &config_path).await?,
        Commands::Sync => run_sync(&db_path, &config_path).await?,
        Commands::Watch => run_watch(&db_path, &config_path).await?,
        Commands::Status { json } => run_status(json, &db_path, &config_path).await?,
        Commands::Conflicts { command } => run_conflicts(command, &db_path, &config_path).await?,
        Commands::Cache { command } => run_cache(command, &db_path).await?,
        Commands::Config { command } => run_config(&command, &config_path)?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests;
