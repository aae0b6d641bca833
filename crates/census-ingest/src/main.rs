//! census-ingest - ACS ingestion and lookup tool

use anyhow::Result;
use census_common::logging::{init_logging, LogConfig};
use census_ingest::{commands, Cli, IngestConfig};
use clap::Parser;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config.level = Level::DEBUG;
    }
    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    commands::apply_overrides(&cli, &mut config)?;
    info!(
        api = %config.api.base_url,
        network = config.network_concurrency,
        storage = config.storage_concurrency,
        "Configuration loaded"
    );

    if let Err(e) = commands::run(cli, config).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
