//! State, county and place loading

use census_common::types::{Dataset, StateWithChildren};
use census_common::{CensusError, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::time::Instant;
use tracing::{debug, info};

use super::Upstream;

/// Default number of states loading at once
pub const DEFAULT_GEOGRAPHY_CONCURRENCY: usize = 20;

pub struct GeographyLoader {
    upstream: Upstream,
    state_concurrency: usize,
}

impl GeographyLoader {
    pub fn new(upstream: Upstream, state_concurrency: usize) -> Self {
        Self {
            upstream,
            state_concurrency: state_concurrency.max(1),
        }
    }

    /// All states in upstream order, each with its counties and places.
    ///
    /// A state's county and place listings are fetched side by side.
    pub async fn load(&self, dataset: &Dataset, year: i32) -> Result<Vec<StateWithChildren>> {
        let started = Instant::now();

        let states = self
            .upstream
            .call("fetch_states", |source| source.fetch_states(dataset, year, None))
            .await?;
        info!(dataset = %dataset.id, year, states = states.len(), "Loaded states");

        let geography: Vec<StateWithChildren> = stream::iter(states)
            .map(|state| async move {
                let counties_label = format!("fetch_counties {}", state.fips);
                let places_label = format!("fetch_places {}", state.fips);
                let (counties, places) = tokio::try_join!(
                    self.upstream.call(&counties_label, |source| {
                        source.fetch_counties(dataset, year, &state.fips, None)
                    }),
                    self.upstream.call(&places_label, |source| {
                        source.fetch_places(dataset, year, &state.fips, None)
                    }),
                )?;
                debug!(
                    dataset = %dataset.id,
                    year,
                    state = %state.fips,
                    counties = counties.len(),
                    places = places.len(),
                    "Loaded state geography"
                );
                Ok::<_, CensusError>(StateWithChildren {
                    fips: state.fips,
                    name: state.name,
                    counties,
                    places,
                })
            })
            .buffered(self.state_concurrency)
            .try_collect()
            .await?;

        info!(
            dataset = %dataset.id,
            year,
            states = geography.len(),
            counties = geography.iter().map(|s| s.counties.len()).sum::<usize>(),
            places = geography.iter().map(|s| s.places.len()).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded geography"
        );
        Ok(geography)
    }
}
