use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tiermem::cli;
use tiermem::config::TierMemConfig;

#[derive(Parser)]
#[command(name = "tiermem", version, about = "Hierarchical memory store for coding assistants")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run periodic tier migration and health checks until Ctrl-C
    Serve,
    /// Run one tier migration cycle
    Migrate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run store diagnostics and database integrity checks
    Health {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.tiermem/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TierMemConfig::load()?;

    // Logs go to stderr so `--json` output on stdout stays parseable.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => cli::serve::serve(config).await?,
        Command::Migrate { json } => {
            tokio::task::spawn_blocking(move || cli::migrate::migrate(config, json)).await??
        }
        Command::Health { json } => {
            tokio::task::spawn_blocking(move || cli::health::health(config, json)).await??
        }
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
    }

    Ok(())
}
