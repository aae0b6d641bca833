//! Command execution
//!
//! Results are printed to stdout as JSON; logs go through `tracing`.

use anyhow::Context as _;
use census_common::types::{Dataset, GeographyFilter, IngestionCheckpoint};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cli::{Cli, Commands, DatasetYear};
use crate::client::{AcsClient, CensusSource, ResponseCache};
use crate::config::{parse_years, IngestConfig};
use crate::lookup::CensusLookup;
use crate::orchestrator::IngestOrchestrator;
use crate::storage::postgres::run_migrations;
use crate::storage::{CensusStore, CheckpointRepository, MemoryStore, PgCensusStore};

/// Storage handles, both traits backed by the same store
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn CensusStore>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
}

impl Backend {
    pub fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            store: Arc::new(store.clone()),
            checkpoints: Arc::new(store),
        }
    }

    /// Connect to Postgres and apply pending migrations
    pub async fn postgres(config: &IngestConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
            .connect(&config.database.url)
            .await
            .context("Failed to connect to the database")?;
        info!("Database connection pool established");

        run_migrations(&pool).await?;
        info!("Database migrations completed");

        let store = PgCensusStore::new(pool).with_batch_size(config.storage_batch_size);
        Ok(Self {
            store: Arc::new(store.clone()),
            checkpoints: Arc::new(store),
        })
    }
}

pub fn build_source(config: &IngestConfig) -> anyhow::Result<Arc<dyn CensusSource>> {
    let cache = Arc::new(ResponseCache::new(
        config.api.cache_capacity,
        Duration::from_secs(config.api.cache_ttl_secs),
    ));
    Ok(Arc::new(AcsClient::with_cache(config.client_config(), cache)?))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Apply CLI overrides to the loaded configuration
pub fn apply_overrides(cli: &Cli, config: &mut IngestConfig) -> anyhow::Result<()> {
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }
    if let Some(key) = &cli.api_key {
        config.api.api_key = Some(key.clone()).filter(|k| !k.is_empty());
    }

    if let Commands::Ingest {
        dataset,
        year,
        groups,
        include_counties,
        ..
    } = &cli.command
    {
        if !dataset.is_empty() {
            config.datasets = dataset.clone();
        }
        if !year.is_empty() {
            config.years = parse_years(&year.join(","))?;
        }
        if !groups.is_empty() {
            config.allowed_groups = Some(groups.clone());
        }
        if *include_counties {
            config.place_only = false;
        }
    }

    config.validate()
}

pub async fn run(cli: Cli, config: IngestConfig) -> anyhow::Result<()> {
    let source = build_source(&config)?;

    let backend = match &cli.command {
        Commands::Ingest { dry_run: true, .. } => {
            info!("Dry run: writing to an in-memory store");
            Backend::memory()
        },
        _ => Backend::postgres(&config).await?,
    };

    execute(cli.command, &config, source, backend).await
}

/// Run one command against the given source and storage
pub async fn execute(
    command: Commands,
    config: &IngestConfig,
    source: Arc<dyn CensusSource>,
    backend: Backend,
) -> anyhow::Result<()> {
    let lookup = CensusLookup::new(source.clone(), backend.store.clone());

    match command {
        Commands::Ingest { .. } => {
            let datasets = config.datasets()?;
            info!(
                datasets = ?config.datasets,
                years = ?config.years,
                place_only = config.place_only,
                "Starting ingestion run"
            );
            let orchestrator = IngestOrchestrator::new(
                source,
                backend.store,
                backend.checkpoints,
                config.ingest_options(),
            );
            let reports = orchestrator.run_all(&datasets, &config.years).await?;
            print_json(&reports)
        },

        Commands::CreateDataset { code, frequency } => {
            let dataset = Dataset::new(code, frequency);
            backend.store.insert_dataset(&dataset).await?;
            info!(dataset = %dataset.id, "Dataset registered");
            print_json(&dataset)
        },

        Commands::Checkpoint { target } => {
            let dataset = Dataset::from_id(&target.dataset)?;
            let checkpoint = backend
                .checkpoints
                .load_checkpoint(&dataset.id, target.year)
                .await?
                .unwrap_or_else(|| IngestionCheckpoint::new(&dataset.id, target.year));
            print_json(&checkpoint)
        },

        Commands::Years { dataset } => {
            let dataset = Dataset::from_id(&dataset)?;
            print_json(&lookup.years(&dataset).await?)
        },

        Commands::Groups { target } => {
            let (dataset, year) = resolve(&target)?;
            print_json(&lookup.groups(&dataset, year).await?)
        },

        Commands::Variables { target, group } => {
            let (dataset, year) = resolve(&target)?;
            print_json(&lookup.variables(&dataset, year, &group).await?)
        },

        Commands::States { target, name } => {
            let (dataset, year) = resolve(&target)?;
            print_json(&lookup.states(&dataset, year, name.as_deref()).await?)
        },

        Commands::Counties {
            target,
            state,
            name,
        } => {
            let (dataset, year) = resolve(&target)?;
            print_json(
                &lookup
                    .counties(&dataset, year, &state, name.as_deref())
                    .await?,
            )
        },

        Commands::Places {
            target,
            state,
            name,
        } => {
            let (dataset, year) = resolve(&target)?;
            print_json(&lookup.places(&dataset, year, &state, name.as_deref()).await?)
        },

        Commands::Estimates {
            target,
            variables,
            state,
            county,
            place,
        } => {
            let (dataset, year) = resolve(&target)?;
            let geography = GeographyFilter {
                state_fips: state,
                county_fips: county,
                place_fips: place,
            };
            print_json(
                &lookup
                    .estimates(&dataset, year, &variables, &geography)
                    .await?,
            )
        },
    }
}

fn resolve(target: &DatasetYear) -> anyhow::Result<(Dataset, i32)> {
    Ok((Dataset::from_id(&target.dataset)?, target.year))
}
