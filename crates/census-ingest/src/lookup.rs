//! Cache-or-fetch reads
//!
//! Every lookup reads storage first and falls back to a live call on a miss.
//! Live results are returned as-is and never written back; only the ingestion
//! pipeline writes. FIPS arguments are zero-padded before either read, so `1`
//! and `01` address the same state.

use census_common::types::{
    pad_fips, Dataset, EstimateRecord, GeographyFilter, GeographyUnit, Group, Variable,
    STATE_FIPS_WIDTH,
};
use census_common::{CensusError, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::client::CensusSource;
use crate::storage::CensusStore;

/// Where a lookup's answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Storage,
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lookup<T> {
    pub origin: Origin,
    pub items: Vec<T>,
}

impl<T> Lookup<T> {
    fn stored(items: Vec<T>) -> Self {
        Self {
            origin: Origin::Storage,
            items,
        }
    }

    fn live(items: Vec<T>) -> Self {
        Self {
            origin: Origin::Live,
            items,
        }
    }
}

#[derive(Clone)]
pub struct CensusLookup {
    source: Arc<dyn CensusSource>,
    store: Arc<dyn CensusStore>,
}

impl CensusLookup {
    pub fn new(source: Arc<dyn CensusSource>, store: Arc<dyn CensusStore>) -> Self {
        Self { source, store }
    }

    /// The year row id, or `NotFound` when the year is not registered
    async fn require_year(&self, dataset: &Dataset, year: i32) -> Result<i64> {
        self.store
            .year_id(&dataset.id, year)
            .await?
            .ok_or_else(|| {
                CensusError::NotFound(format!("year {} for dataset {}", year, dataset.id))
            })
    }

    /// Registered years, or the announced years when none are registered
    pub async fn years(&self, dataset: &Dataset) -> Result<Lookup<i32>> {
        let stored = self.store.list_years(&dataset.id).await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored.into_iter().map(|y| y.year).collect()));
        }
        debug!(dataset = %dataset.id, "No registered years, fetching announced years");
        Ok(Lookup::live(self.source.fetch_years(dataset.frequency).await?))
    }

    pub async fn groups(&self, dataset: &Dataset, year: i32) -> Result<Lookup<Group>> {
        let year_id = self.require_year(dataset, year).await?;
        let stored = self.store.get_groups(&dataset.id, year_id).await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored));
        }
        Ok(Lookup::live(self.source.fetch_groups(dataset, year).await?))
    }

    pub async fn variables(
        &self,
        dataset: &Dataset,
        year: i32,
        group_id: &str,
    ) -> Result<Lookup<Variable>> {
        let year_id = self.require_year(dataset, year).await?;
        let stored = self
            .store
            .get_variables(&dataset.id, year_id, group_id)
            .await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored));
        }
        Ok(Lookup::live(
            self.source.fetch_variables(dataset, year, group_id).await?,
        ))
    }

    /// States, optionally narrowed to the one named `name`
    pub async fn states(
        &self,
        dataset: &Dataset,
        year: i32,
        name: Option<&str>,
    ) -> Result<Lookup<GeographyUnit>> {
        let year_id = self.require_year(dataset, year).await?;
        let stored = self.store.get_states(&dataset.id, year_id, name).await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored));
        }
        Ok(Lookup::live(
            self.source.fetch_states(dataset, year, name).await?,
        ))
    }

    pub async fn counties(
        &self,
        dataset: &Dataset,
        year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Lookup<GeographyUnit>> {
        let state_fips = pad_fips(state_fips, STATE_FIPS_WIDTH);
        let year_id = self.require_year(dataset, year).await?;
        let stored = self
            .store
            .get_counties(&dataset.id, year_id, &state_fips, name)
            .await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored));
        }
        Ok(Lookup::live(
            self.source
                .fetch_counties(dataset, year, &state_fips, name)
                .await?,
        ))
    }

    pub async fn places(
        &self,
        dataset: &Dataset,
        year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Lookup<GeographyUnit>> {
        let state_fips = pad_fips(state_fips, STATE_FIPS_WIDTH);
        let year_id = self.require_year(dataset, year).await?;
        let stored = self
            .store
            .get_places(&dataset.id, year_id, &state_fips, name)
            .await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored));
        }
        Ok(Lookup::live(
            self.source
                .fetch_places(dataset, year, &state_fips, name)
                .await?,
        ))
    }

    /// Estimates for one geography. A live answer is served only when storage
    /// holds none of the requested variables.
    pub async fn estimates(
        &self,
        dataset: &Dataset,
        year: i32,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> Result<Lookup<EstimateRecord>> {
        let geography = &geography.normalized();
        geography.scope()?;
        let year_id = self.require_year(dataset, year).await?;
        let stored = self
            .store
            .get_estimates(&dataset.id, year_id, variable_ids, geography)
            .await?;
        if !stored.is_empty() {
            return Ok(Lookup::stored(stored));
        }

        let rows = self
            .source
            .fetch_estimates(dataset, year, variable_ids, geography)
            .await?;
        Ok(Lookup::live(
            rows.into_iter()
                .flat_map(|row| row.into_records(geography, &dataset.id, year_id))
                .collect(),
        ))
    }
}
