//! Shared fixtures for census-ingest integration tests
//!
//! - [`MockSource`]: a scripted [`CensusSource`] that records every call and the
//!   worker pool it ran in
//! - [`RecordingStore`]: a [`MemoryStore`] wrapper recording the pool of every write
//! - [`TestPostgres`]: a Postgres container with migrations applied

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use census_common::types::{
    AvailableYear, Dataset, EstimateRecord, EstimateRow, EstimateValue, Frequency,
    GeographyFilter, GeographyUnit, Group, IngestionCheckpoint, Stage, Variable, VariableRecord,
};
use census_common::CensusError;
use census_ingest::client::CensusSource;
use census_ingest::executor::{current_pool, PoolKind};
use census_ingest::retry::RetryPolicy;
use census_ingest::storage::{CensusStore, CheckpointRepository, MemoryStore};
use census_ingest::IngestOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

// ============================================================================
// Scripted source
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Years,
    Groups,
    Variables(String),
    States,
    Counties(String),
    Places(String),
    Estimates {
        geography: GeographyFilter,
        variables: Vec<String>,
    },
}

#[derive(Default)]
pub struct MockSource {
    years: Vec<i32>,
    groups: Vec<Group>,
    variables: BTreeMap<String, Vec<Variable>>,
    states: Vec<GeographyUnit>,
    counties: BTreeMap<String, Vec<GeographyUnit>>,
    places: BTreeMap<String, Vec<GeographyUnit>>,
    failing_groups: BTreeSet<String>,
    failing_places: BTreeSet<String>,
    calls: Mutex<Vec<(SourceCall, Option<PoolKind>)>>,
}

fn unavailable(what: &str) -> CensusError {
    CensusError::SourceUnavailable {
        url: format!("mock://{}", what),
        status: Some(503),
        message: "scripted failure".to_string(),
    }
}

fn filter_named(units: Vec<GeographyUnit>, name: Option<&str>) -> census_common::Result<Vec<GeographyUnit>> {
    match name {
        None => Ok(units),
        Some(name) => {
            let matched: Vec<_> = units.into_iter().filter(|u| u.name == name).collect();
            if matched.is_empty() {
                Err(CensusError::NotFound(name.to_string()))
            } else {
                Ok(matched)
            }
        },
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_years(mut self, years: &[i32]) -> Self {
        self.years = years.to_vec();
        self
    }

    /// Add a group with `count` estimate variables named `{group}_{nnn}E`
    pub fn with_group(mut self, group_id: &str, count: usize) -> Self {
        let variables: Vec<Variable> = (1..=count)
            .map(|i| Variable {
                id: format!("{}_{:03}E", group_id, i),
                description: format!("Estimate!!Total!!{}", i),
            })
            .collect();
        self.groups.push(Group {
            id: group_id.to_string(),
            description: format!("Table {}", group_id),
            variable_count: 0,
        });
        self.variables.insert(group_id.to_string(), variables);
        self
    }

    pub fn with_state(mut self, fips: &str, name: &str, counties: &[&str], places: &[&str]) -> Self {
        self.states.push(GeographyUnit {
            name: name.to_string(),
            fips: fips.to_string(),
            parent_fips: None,
        });
        let child = |code: &&str, kind: &str| GeographyUnit {
            name: format!("{} {}, {}", kind, code, name),
            fips: code.to_string(),
            parent_fips: Some(fips.to_string()),
        };
        self.counties.insert(
            fips.to_string(),
            counties.iter().map(|c| child(c, "County")).collect(),
        );
        self.places.insert(
            fips.to_string(),
            places.iter().map(|p| child(p, "Place")).collect(),
        );
        self
    }

    /// Every variables fetch for this group fails
    pub fn failing_group(mut self, group_id: &str) -> Self {
        self.failing_groups.insert(group_id.to_string());
        self
    }

    /// Every estimate fetch for this place fails
    pub fn failing_place(mut self, place_fips: &str) -> Self {
        self.failing_places.insert(place_fips.to_string());
        self
    }

    fn record(&self, call: SourceCall) {
        self.calls
            .lock()
            .expect("calls lock")
            .push((call, current_pool()));
    }

    pub fn calls(&self) -> Vec<(SourceCall, Option<PoolKind>)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, matches: impl Fn(&SourceCall) -> bool) -> usize {
        self.calls().iter().filter(|(call, _)| matches(call)).count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().expect("calls lock").clear();
    }
}

#[async_trait]
impl CensusSource for MockSource {
    async fn fetch_years(&self, _frequency: Frequency) -> census_common::Result<Vec<i32>> {
        self.record(SourceCall::Years);
        Ok(self.years.clone())
    }

    async fn fetch_groups(&self, _dataset: &Dataset, _year: i32) -> census_common::Result<Vec<Group>> {
        self.record(SourceCall::Groups);
        Ok(self.groups.clone())
    }

    async fn fetch_variables(
        &self,
        _dataset: &Dataset,
        _year: i32,
        group_id: &str,
    ) -> census_common::Result<Vec<Variable>> {
        self.record(SourceCall::Variables(group_id.to_string()));
        if self.failing_groups.contains(group_id) {
            return Err(unavailable(group_id));
        }
        self.variables
            .get(group_id)
            .cloned()
            .ok_or_else(|| CensusError::NotFound(group_id.to_string()))
    }

    async fn fetch_states(
        &self,
        _dataset: &Dataset,
        _year: i32,
        name: Option<&str>,
    ) -> census_common::Result<Vec<GeographyUnit>> {
        self.record(SourceCall::States);
        filter_named(self.states.clone(), name)
    }

    async fn fetch_counties(
        &self,
        _dataset: &Dataset,
        _year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> census_common::Result<Vec<GeographyUnit>> {
        self.record(SourceCall::Counties(state_fips.to_string()));
        filter_named(
            self.counties.get(state_fips).cloned().unwrap_or_default(),
            name,
        )
    }

    async fn fetch_places(
        &self,
        _dataset: &Dataset,
        _year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> census_common::Result<Vec<GeographyUnit>> {
        self.record(SourceCall::Places(state_fips.to_string()));
        filter_named(
            self.places.get(state_fips).cloned().unwrap_or_default(),
            name,
        )
    }

    async fn fetch_estimates(
        &self,
        _dataset: &Dataset,
        _year: i32,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> census_common::Result<Vec<EstimateRow>> {
        self.record(SourceCall::Estimates {
            geography: geography.clone(),
            variables: variable_ids.to_vec(),
        });
        geography.scope()?;
        if let Some(place) = &geography.place_fips {
            if self.failing_places.contains(place) {
                return Err(unavailable(place));
            }
        }

        Ok(vec![EstimateRow {
            state_fips: geography.state_fips.clone(),
            county_fips: geography.county_fips.clone(),
            place_fips: geography.place_fips.clone(),
            values: variable_ids
                .iter()
                .enumerate()
                .map(|(i, id)| EstimateValue {
                    variable_id: id.clone(),
                    raw_value: Some(format!("{}", (i + 1) * 100)),
                })
                .collect(),
        }])
    }
}

/// acs5 fixture: `B01` with 4 variables, `B02` with 1, state 01 with 2 places
pub fn two_group_source() -> MockSource {
    MockSource::new()
        .with_years(&[2019, 2020, 2021])
        .with_group("B01", 4)
        .with_group("B02", 1)
        .with_state("01", "Alabama", &["001", "003"], &["07000", "37000"])
}

/// Fast options for tests: one retry, millisecond backoff, no call timeout
pub fn test_options() -> IngestOptions {
    IngestOptions {
        network_concurrency: 4,
        storage_concurrency: 2,
        group_concurrency: 2,
        geography_concurrency: 2,
        retry: RetryPolicy::new(1, Duration::from_millis(1)),
        call_timeout: None,
        ..IngestOptions::default()
    }
}

// ============================================================================
// Pool-recording store
// ============================================================================

/// Delegates to a [`MemoryStore`], recording the pool each write ran in
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    writes: Mutex<Vec<(&'static str, Option<PoolKind>)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, operation: &'static str) {
        self.writes
            .lock()
            .expect("writes lock")
            .push((operation, current_pool()));
    }

    pub fn writes(&self) -> Vec<(&'static str, Option<PoolKind>)> {
        self.writes.lock().expect("writes lock").clone()
    }
}

#[async_trait]
impl CensusStore for RecordingStore {
    async fn insert_dataset(&self, dataset: &Dataset) -> census_common::Result<()> {
        self.record("insert_dataset");
        self.inner.insert_dataset(dataset).await
    }

    async fn ensure_year(&self, dataset_id: &str, year: i32) -> census_common::Result<i64> {
        self.record("ensure_year");
        self.inner.ensure_year(dataset_id, year).await
    }

    async fn year_id(&self, dataset_id: &str, year: i32) -> census_common::Result<Option<i64>> {
        self.inner.year_id(dataset_id, year).await
    }

    async fn list_years(&self, dataset_id: &str) -> census_common::Result<Vec<AvailableYear>> {
        self.inner.list_years(dataset_id).await
    }

    async fn insert_groups(
        &self,
        dataset_id: &str,
        year_id: i64,
        groups: &[Group],
    ) -> census_common::Result<u64> {
        self.record("insert_groups");
        self.inner.insert_groups(dataset_id, year_id, groups).await
    }

    async fn insert_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        variables: &[VariableRecord],
    ) -> census_common::Result<u64> {
        self.record("insert_variables");
        self.inner.insert_variables(dataset_id, year_id, variables).await
    }

    async fn insert_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        states: &[GeographyUnit],
    ) -> census_common::Result<u64> {
        self.record("insert_states");
        self.inner.insert_states(dataset_id, year_id, states).await
    }

    async fn insert_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        counties: &[GeographyUnit],
    ) -> census_common::Result<u64> {
        self.record("insert_counties");
        self.inner.insert_counties(dataset_id, year_id, counties).await
    }

    async fn insert_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        places: &[GeographyUnit],
    ) -> census_common::Result<u64> {
        self.record("insert_places");
        self.inner.insert_places(dataset_id, year_id, places).await
    }

    async fn insert_estimates(&self, records: &[EstimateRecord]) -> census_common::Result<u64> {
        self.record("insert_estimates");
        self.inner.insert_estimates(records).await
    }

    async fn get_groups(&self, dataset_id: &str, year_id: i64) -> census_common::Result<Vec<Group>> {
        self.inner.get_groups(dataset_id, year_id).await
    }

    async fn get_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        group_id: &str,
    ) -> census_common::Result<Vec<Variable>> {
        self.inner.get_variables(dataset_id, year_id, group_id).await
    }

    async fn get_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        name: Option<&str>,
    ) -> census_common::Result<Vec<GeographyUnit>> {
        self.inner.get_states(dataset_id, year_id, name).await
    }

    async fn get_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> census_common::Result<Vec<GeographyUnit>> {
        self.inner
            .get_counties(dataset_id, year_id, state_fips, name)
            .await
    }

    async fn get_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> census_common::Result<Vec<GeographyUnit>> {
        self.inner
            .get_places(dataset_id, year_id, state_fips, name)
            .await
    }

    async fn get_estimates(
        &self,
        dataset_id: &str,
        year_id: i64,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> census_common::Result<Vec<EstimateRecord>> {
        self.inner
            .get_estimates(dataset_id, year_id, variable_ids, geography)
            .await
    }
}

#[async_trait]
impl CheckpointRepository for RecordingStore {
    async fn load_checkpoint(
        &self,
        dataset_id: &str,
        year: i32,
    ) -> census_common::Result<Option<IngestionCheckpoint>> {
        self.record("load_checkpoint");
        self.inner.load_checkpoint(dataset_id, year).await
    }

    async fn insert_checkpoint_if_absent(&self, dataset_id: &str, year: i32) -> census_common::Result<()> {
        self.record("insert_checkpoint");
        self.inner.insert_checkpoint_if_absent(dataset_id, year).await
    }

    async fn set_checkpoint_flag(
        &self,
        dataset_id: &str,
        year: i32,
        stage: Stage,
    ) -> census_common::Result<()> {
        self.record("set_checkpoint_flag");
        self.inner.set_checkpoint_flag(dataset_id, year, stage).await
    }
}

// ============================================================================
// PostgreSQL test container
// ============================================================================

/// Postgres container with the census schema migrated
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        census_ingest::storage::postgres::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
