//! Ingestion orchestrator
//!
//! Runs the stages for one (dataset, year) in a fixed order:
//!
//! 1. groups and variables
//! 2. geography (states, counties, places)
//! 3. estimates
//!
//! Each stage is skipped when its checkpoint flag is already set, and its flag
//! is set only after its data has been written. A stage that needs data from a
//! skipped stage re-runs that stage's loader against the upstream source.

use census_common::types::{Dataset, GeographyUnit, Stage, StateWithChildren, VariableRecord};
use census_common::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::client::{CensusSource, MAX_VARIABLES_PER_REQUEST};
use crate::estimates::{chunk_variable_batches, EstimateScheduler, EstimateStats, DEFAULT_WINDOW_MULTIPLIER};
use crate::executor::{Executors, WorkerPool};
use crate::loaders::geography::DEFAULT_GEOGRAPHY_CONCURRENCY;
use crate::loaders::metadata::DEFAULT_GROUP_CONCURRENCY;
use crate::loaders::{GeographyLoader, MetadataCatalog, MetadataLoader, Upstream};
use crate::retry::RetryPolicy;
use crate::storage::{CensusStore, CheckpointRepository, DEFAULT_STORAGE_BATCH_SIZE};

pub const DEFAULT_NETWORK_CONCURRENCY: usize = 40;
pub const DEFAULT_STORAGE_CONCURRENCY: usize = 10;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Tuning knobs for one ingestion run. None of them affect what gets stored.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub network_concurrency: usize,
    pub storage_concurrency: usize,
    pub group_concurrency: usize,
    pub geography_concurrency: usize,
    pub retry: RetryPolicy,
    pub call_timeout: Option<Duration>,
    pub vars_per_request: usize,
    pub window_multiplier: usize,
    pub storage_batch_size: usize,
    /// Request estimates for places only, skipping counties
    pub place_only: bool,
    /// Restrict ingestion to these group ids
    pub allowed_groups: Option<Vec<String>>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            network_concurrency: DEFAULT_NETWORK_CONCURRENCY,
            storage_concurrency: DEFAULT_STORAGE_CONCURRENCY,
            group_concurrency: DEFAULT_GROUP_CONCURRENCY,
            geography_concurrency: DEFAULT_GEOGRAPHY_CONCURRENCY,
            retry: RetryPolicy::default(),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            vars_per_request: MAX_VARIABLES_PER_REQUEST,
            window_multiplier: DEFAULT_WINDOW_MULTIPLIER,
            storage_batch_size: DEFAULT_STORAGE_BATCH_SIZE,
            place_only: true,
            allowed_groups: None,
        }
    }
}

impl IngestOptions {
    pub fn window(&self) -> usize {
        self.network_concurrency.saturating_mul(self.window_multiplier).max(1)
    }
}

/// What one (dataset, year) run did
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub dataset_id: String,
    pub year: i32,
    pub stages_run: Vec<Stage>,
    pub stages_skipped: Vec<Stage>,
    pub groups_written: u64,
    pub variables_written: u64,
    pub states_written: u64,
    pub counties_written: u64,
    pub places_written: u64,
    pub estimates: Option<EstimateStats>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

pub struct IngestOrchestrator {
    store: Arc<dyn CensusStore>,
    checkpoints: CheckpointStore,
    metadata: MetadataLoader,
    geography: GeographyLoader,
    estimates: EstimateScheduler,
    executors: Executors,
    options: IngestOptions,
}

impl IngestOrchestrator {
    pub fn new(
        source: Arc<dyn CensusSource>,
        store: Arc<dyn CensusStore>,
        checkpoints: Arc<dyn CheckpointRepository>,
        options: IngestOptions,
    ) -> Self {
        let executors = Executors::new(
            options.network_concurrency,
            options.storage_concurrency,
            options.call_timeout,
        );
        let upstream = Upstream::new(source, executors.network.clone(), options.retry);

        Self {
            metadata: MetadataLoader::new(upstream.clone(), options.group_concurrency),
            geography: GeographyLoader::new(upstream.clone(), options.geography_concurrency),
            estimates: EstimateScheduler::new(
                upstream,
                store.clone(),
                executors.storage.clone(),
                options.window(),
            ),
            checkpoints: CheckpointStore::new(checkpoints),
            store,
            executors,
            options,
        }
    }

    fn storage(&self) -> &WorkerPool {
        &self.executors.storage
    }

    /// Ingest every (dataset, year) pair in order, stopping at the first fatal error
    pub async fn run_all(&self, datasets: &[Dataset], years: &[i32]) -> Result<Vec<IngestReport>> {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(datasets.len() * years.len());

        for dataset in datasets {
            for &year in years {
                reports.push(self.run(dataset, year).await?);
            }
        }

        info!(
            runs = reports.len(),
            network_calls = self.executors.network.submitted(),
            storage_calls = self.executors.storage.submitted(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "All ingestion runs complete"
        );
        Ok(reports)
    }

    /// Ingest one (dataset, year), resuming from its checkpoint
    pub async fn run(&self, dataset: &Dataset, year: i32) -> Result<IngestReport> {
        let span = info_span!("ingest", dataset = %dataset.id, year);
        self.run_inner(dataset, year).instrument(span).await
    }

    async fn run_inner(&self, dataset: &Dataset, year: i32) -> Result<IngestReport> {
        let started = Instant::now();
        info!("Starting ingestion");

        let mut report = IngestReport {
            dataset_id: dataset.id.clone(),
            year,
            started_at: Utc::now(),
            ..IngestReport::default()
        };

        self.storage()
            .run("insert_dataset", self.store.insert_dataset(dataset))
            .await?;
        let year_id = self
            .storage()
            .run("ensure_year", self.store.ensure_year(&dataset.id, year))
            .await?;
        let checkpoint = self
            .storage()
            .run("checkpoint", self.checkpoints.get_or_create(&dataset.id, year))
            .await?;
        info!(?checkpoint, year_id, "Checkpoint loaded");

        // Stage 1: groups and variables
        let mut catalog: Option<MetadataCatalog> = None;
        if checkpoint.groups_ingested && checkpoint.variables_ingested {
            info!("Skipping groups and variables (already ingested)");
            report.stages_skipped.extend([Stage::Groups, Stage::Variables]);
        } else {
            let stage_started = Instant::now();
            info!("Stage started: groups and variables");
            let loaded = self.load_metadata(dataset, year).await?;
            report.groups_written = self.persist_groups(dataset, year_id, &loaded).await?;
            report.variables_written = self
                .persist_variables(dataset, year_id, &loaded.variable_records())
                .await?;
            self.mark(dataset, year, Stage::Groups).await?;
            self.mark(dataset, year, Stage::Variables).await?;
            info!(
                groups = report.groups_written,
                variables = report.variables_written,
                elapsed_secs = stage_started.elapsed().as_secs_f64(),
                "Stage complete: groups and variables"
            );
            report.stages_run.extend([Stage::Groups, Stage::Variables]);
            catalog = Some(loaded);
        }

        // Stage 2: geography
        let mut geography: Option<Vec<StateWithChildren>> = None;
        if checkpoint.geography_ingested {
            info!("Skipping geography (already ingested)");
            report.stages_skipped.push(Stage::Geography);
        } else {
            let stage_started = Instant::now();
            info!("Stage started: geography");
            let loaded = self.geography.load(dataset, year).await?;
            self.persist_geography(dataset, year_id, &loaded, &mut report)
                .await?;
            self.mark(dataset, year, Stage::Geography).await?;
            info!(
                states = report.states_written,
                counties = report.counties_written,
                places = report.places_written,
                elapsed_secs = stage_started.elapsed().as_secs_f64(),
                "Stage complete: geography"
            );
            report.stages_run.push(Stage::Geography);
            geography = Some(loaded);
        }

        // Stage 3: estimates
        if checkpoint.estimates_ingested {
            info!("Skipping estimates (already ingested)");
            report.stages_skipped.push(Stage::Estimates);
        } else {
            let stage_started = Instant::now();
            info!("Stage started: estimates");

            let catalog = match catalog {
                Some(catalog) => catalog,
                None => {
                    info!("Reloading variable catalog from upstream for estimates");
                    self.load_metadata(dataset, year).await?
                },
            };
            let geography = match geography {
                Some(geography) => geography,
                None => {
                    info!("Reloading geography from upstream for estimates");
                    self.geography.load(dataset, year).await?
                },
            };

            let batches =
                chunk_variable_batches(&catalog.variables_by_group, self.options.vars_per_request);
            let stats = self
                .estimates
                .run(
                    dataset,
                    year,
                    year_id,
                    &geography,
                    &batches,
                    !self.options.place_only,
                )
                .await;

            // Set even when some jobs failed
            self.mark(dataset, year, Stage::Estimates).await?;
            info!(
                jobs = stats.submitted,
                failed = stats.failed,
                rows = stats.rows_written,
                elapsed_secs = stage_started.elapsed().as_secs_f64(),
                "Stage complete: estimates"
            );
            report.estimates = Some(stats);
            report.stages_run.push(Stage::Estimates);
        }

        report.finished_at = Utc::now();
        report.elapsed = started.elapsed();
        info!(
            stages_run = report.stages_run.len(),
            stages_skipped = report.stages_skipped.len(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Ingestion complete"
        );
        Ok(report)
    }

    async fn load_metadata(&self, dataset: &Dataset, year: i32) -> Result<MetadataCatalog> {
        self.metadata
            .load(dataset, year, self.options.allowed_groups.as_deref())
            .await
    }

    async fn mark(&self, dataset: &Dataset, year: i32, stage: Stage) -> Result<()> {
        self.storage()
            .run(
                stage.as_str(),
                self.checkpoints.mark_stage(&dataset.id, year, stage),
            )
            .await
    }

    async fn persist_groups(
        &self,
        dataset: &Dataset,
        year_id: i64,
        catalog: &MetadataCatalog,
    ) -> Result<u64> {
        let mut written = 0;
        for chunk in catalog.groups.chunks(self.options.storage_batch_size.max(1)) {
            written += self
                .storage()
                .run("insert_groups", self.store.insert_groups(&dataset.id, year_id, chunk))
                .await?;
        }
        Ok(written)
    }

    async fn persist_variables(
        &self,
        dataset: &Dataset,
        year_id: i64,
        variables: &[VariableRecord],
    ) -> Result<u64> {
        let mut written = 0;
        for chunk in variables.chunks(self.options.storage_batch_size.max(1)) {
            written += self
                .storage()
                .run(
                    "insert_variables",
                    self.store.insert_variables(&dataset.id, year_id, chunk),
                )
                .await?;
        }
        Ok(written)
    }

    async fn persist_geography(
        &self,
        dataset: &Dataset,
        year_id: i64,
        geography: &[StateWithChildren],
        report: &mut IngestReport,
    ) -> Result<()> {
        let batch_size = self.options.storage_batch_size.max(1);
        let states: Vec<_> = geography
            .iter()
            .map(|s| GeographyUnit {
                name: s.name.clone(),
                fips: s.fips.clone(),
                parent_fips: None,
            })
            .collect();
        for chunk in states.chunks(batch_size) {
            report.states_written += self
                .storage()
                .run("insert_states", self.store.insert_states(&dataset.id, year_id, chunk))
                .await?;
        }

        let counties: Vec<_> = geography.iter().flat_map(|s| s.counties.iter().cloned()).collect();
        for chunk in counties.chunks(batch_size) {
            report.counties_written += self
                .storage()
                .run(
                    "insert_counties",
                    self.store.insert_counties(&dataset.id, year_id, chunk),
                )
                .await?;
        }

        let places: Vec<_> = geography.iter().flat_map(|s| s.places.iter().cloned()).collect();
        for chunk in places.chunks(batch_size) {
            report.places_written += self
                .storage()
                .run("insert_places", self.store.insert_places(&dataset.id, year_id, chunk))
                .await?;
        }
        Ok(())
    }
}
