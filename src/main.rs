//! research-clerk - categorize a Zotero library without corrupting it
//!
//! Inspection commands are read-only and safe while Zotero runs. Commands
//! that write refuse to start while Zotero holds the database, and always
//! take a backup first.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = cli::load_config(&cli)?;

    match &cli.command {
        Commands::Categorize { batch_size } => cli::categorize(&config, *batch_size)?,
        Commands::Apply { file } => cli::apply(&config, file)?,
        Commands::Reorganize { batch_size } => cli::reorganize(&config, *batch_size)?,
        Commands::ApplyReorganization { file } => cli::apply_reorganization(&config, file)?,
        Commands::CleanupDuplicates => cli::cleanup_duplicates(&config)?,
        Commands::Collections => cli::collections(&config)?,
        Commands::Unfiled => cli::unfiled(&config)?,
        Commands::Backup => cli::backup(&config)?,
        Commands::Watch { once } => cli::watch(&config, *once).await?,
    }

    Ok(())
}
