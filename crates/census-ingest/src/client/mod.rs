//! Upstream data source
//!
//! [`CensusSource`] is the seam between the ingestion pipeline and the Census
//! Bureau. [`AcsClient`] is the HTTP implementation; tests substitute scripted
//! sources.

pub mod acs;
pub mod cache;
pub mod years;

use async_trait::async_trait;
use census_common::types::{
    Dataset, EstimateRow, Frequency, GeographyFilter, GeographyUnit, Group, Variable,
};
use census_common::Result;

pub use acs::{AcsClient, AcsClientConfig};
pub use cache::{CachedResponse, ResponseCache};

/// Maximum number of variables the statistical API accepts per call
pub const MAX_VARIABLES_PER_REQUEST: usize = 50;

/// One call per method, no retries. Retrying and pooling are the caller's job.
#[async_trait]
pub trait CensusSource: Send + Sync {
    /// Inclusive list of years announced for a product
    async fn fetch_years(&self, frequency: Frequency) -> Result<Vec<i32>>;

    async fn fetch_groups(&self, dataset: &Dataset, year: i32) -> Result<Vec<Group>>;

    async fn fetch_variables(
        &self,
        dataset: &Dataset,
        year: i32,
        group_id: &str,
    ) -> Result<Vec<Variable>>;

    /// All states, or the one named `name` (`NotFound` when absent)
    async fn fetch_states(
        &self,
        dataset: &Dataset,
        year: i32,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>>;

    async fn fetch_counties(
        &self,
        dataset: &Dataset,
        year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>>;

    async fn fetch_places(
        &self,
        dataset: &Dataset,
        year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>>;

    /// One row per matched unit, values in the order of `variable_ids`.
    ///
    /// `variable_ids` must hold 1..=[`MAX_VARIABLES_PER_REQUEST`] ids, and
    /// `geography` must address exactly one level.
    async fn fetch_estimates(
        &self,
        dataset: &Dataset,
        year: i32,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> Result<Vec<EstimateRow>>;
}

/// Keep only units whose name equals `name`, failing when none match
pub(crate) fn filter_by_name(
    units: Vec<GeographyUnit>,
    name: Option<&str>,
    level: &str,
) -> Result<Vec<GeographyUnit>> {
    match name {
        None => Ok(units),
        Some(name) => {
            let matched: Vec<_> = units.into_iter().filter(|u| u.name == name).collect();
            if matched.is_empty() {
                Err(census_common::CensusError::NotFound(format!("{} '{}'", level, name)))
            } else {
                Ok(matched)
            }
        },
    }
}
