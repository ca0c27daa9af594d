use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use covi_storage::WeaviateStore;
use covi_sync::{AppConfig, RunKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "covi")]
#[command(about = "Company overview ingestion into a vector document store")]
struct Cli {
    /// YAML configuration file; COVI_* environment variables are used when absent.
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run triggers until ctrl-c.
    Run,
    /// Ingest the configured batch source once.
    Ingest,
    /// Poll the quote API once for the configured symbols.
    Poll,
    /// Create (or recreate) the document store class.
    InitSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_yaml_file(path).await?,
        None => AppConfig::from_env()?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => covi_sync::run_service(config).await?,
        Commands::Ingest => {
            let kind = RunKind::Ingest(config.batch_ingest.kind);
            let report = covi_sync::run_once(&config, kind).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Poll => {
            let report = covi_sync::run_once(&config, RunKind::Poll).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::InitSchema => {
            let mut weaviate = config.weaviate.clone();
            weaviate.initialize_schema = true;
            let store = WeaviateStore::new(weaviate, config.http_timeout())?;
            let action = store
                .ensure_schema()
                .await
                .with_context(|| format!("initializing class {}", store.class_name()))?;
            info!(name = store.class_name(), ?action, "schema initialized");
        }
    }

    Ok(())
}
