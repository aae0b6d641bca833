//! Relational storage
//!
//! Two seams: [`CensusStore`] for the cached census entities and
//! [`CheckpointRepository`] for ingestion progress. Every insert ignores rows
//! whose natural key already exists and reports how many rows were new.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use census_common::types::{
    AvailableYear, Dataset, EstimateRecord, GeographyFilter, GeographyUnit, Group,
    IngestionCheckpoint, Stage, Variable, VariableRecord,
};
use census_common::Result;

pub use memory::MemoryStore;
pub use postgres::PgCensusStore;

/// Default rows per insert statement
pub const DEFAULT_STORAGE_BATCH_SIZE: usize = 1000;

#[async_trait]
pub trait CensusStore: Send + Sync {
    /// Register a dataset; a no-op when the id already exists
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()>;

    /// Get-or-create the year row, returning its id
    async fn ensure_year(&self, dataset_id: &str, year: i32) -> Result<i64>;

    async fn year_id(&self, dataset_id: &str, year: i32) -> Result<Option<i64>>;

    async fn list_years(&self, dataset_id: &str) -> Result<Vec<AvailableYear>>;

    async fn insert_groups(&self, dataset_id: &str, year_id: i64, groups: &[Group]) -> Result<u64>;

    async fn insert_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        variables: &[VariableRecord],
    ) -> Result<u64>;

    async fn insert_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        states: &[GeographyUnit],
    ) -> Result<u64>;

    /// Counties must carry their state in `parent_fips`
    async fn insert_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        counties: &[GeographyUnit],
    ) -> Result<u64>;

    /// Places must carry their state in `parent_fips`
    async fn insert_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        places: &[GeographyUnit],
    ) -> Result<u64>;

    async fn insert_estimates(&self, records: &[EstimateRecord]) -> Result<u64>;

    async fn get_groups(&self, dataset_id: &str, year_id: i64) -> Result<Vec<Group>>;

    async fn get_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        group_id: &str,
    ) -> Result<Vec<Variable>>;

    async fn get_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>>;

    async fn get_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>>;

    async fn get_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>>;

    /// Stored estimates for exactly this geography and any of `variable_ids`
    async fn get_estimates(
        &self,
        dataset_id: &str,
        year_id: i64,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> Result<Vec<EstimateRecord>>;
}

/// Checkpoint persistence. Only [`CheckpointStore`](crate::checkpoint::CheckpointStore) calls this.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn load_checkpoint(
        &self,
        dataset_id: &str,
        year: i32,
    ) -> Result<Option<IngestionCheckpoint>>;

    /// Create an all-false row unless one exists
    async fn insert_checkpoint_if_absent(&self, dataset_id: &str, year: i32) -> Result<()>;

    /// Set one flag to true; setting an already-true flag is a no-op
    async fn set_checkpoint_flag(&self, dataset_id: &str, year: i32, stage: Stage) -> Result<()>;
}

/// Storage form of an optional FIPS column
pub(crate) fn fips_key(fips: &Option<String>) -> String {
    fips.clone().unwrap_or_default()
}

/// Inverse of [`fips_key`]
pub(crate) fn fips_from_key(key: String) -> Option<String> {
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
