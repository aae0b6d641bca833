//! Estimate streaming scheduler
//!
//! The job space is (variable batch) x (geographic unit). Jobs are produced
//! lazily from the geography and pulled into a sliding window of at most
//! `window` in-flight jobs, so neither pending work nor memory grows with the
//! size of the job space.
//!
//! A job that fails after its retries is logged and counted. It never stops the
//! stream: the missing cells can be backfilled by running the stage again,
//! since estimate writes ignore rows that already exist.

use census_common::types::{
    margin_sibling, Dataset, EstimateRecord, GeographyFilter, StateWithChildren, Variable,
};
use census_common::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::client::MAX_VARIABLES_PER_REQUEST;
use crate::executor::WorkerPool;
use crate::loaders::Upstream;
use crate::storage::CensusStore;

/// Default ratio of window size to network pool size
pub const DEFAULT_WINDOW_MULTIPLIER: usize = 2;

/// Up to [`MAX_VARIABLES_PER_REQUEST`] variables of one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBatch {
    pub group_id: String,
    pub variable_ids: Vec<String>,
}

/// Split every group's variable list into runs of at most `batch_size`.
///
/// An estimate (`_001E`) and its margin of error (`_001M`) always land in the
/// same batch, next to each other, so the margin folds into the estimate's
/// record whatever the batch size. A pair never splits, even at a batch size
/// of one.
pub fn chunk_variable_batches(
    variables_by_group: &BTreeMap<String, Vec<Variable>>,
    batch_size: usize,
) -> Vec<VariableBatch> {
    let batch_size = batch_size.clamp(1, MAX_VARIABLES_PER_REQUEST);
    let mut batches = Vec::new();

    for (group_id, variables) in variables_by_group {
        let mut current: Vec<String> = Vec::with_capacity(batch_size);
        for unit in pair_margins(variables) {
            if !current.is_empty() && current.len() + unit.len() > batch_size {
                batches.push(VariableBatch {
                    group_id: group_id.clone(),
                    variable_ids: std::mem::take(&mut current),
                });
            }
            current.extend(unit);
        }
        if !current.is_empty() {
            batches.push(VariableBatch {
                group_id: group_id.clone(),
                variable_ids: current,
            });
        }
    }
    batches
}

/// Group ids into the units a batch must not split: `[E, M]` when both are
/// present, otherwise a single id. Order follows the first id of each unit.
fn pair_margins(variables: &[Variable]) -> Vec<Vec<String>> {
    let ids: HashSet<&str> = variables.iter().map(|v| v.id.as_str()).collect();
    let paired = |id: &str| margin_sibling(id).filter(|e| ids.contains(e.as_str()));

    variables
        .iter()
        .filter(|v| paired(v.id.as_str()).is_none())
        .map(|v| {
            let margin = v
                .id
                .strip_suffix('E')
                .map(|stem| format!("{}M", stem))
                .filter(|m| ids.contains(m.as_str()) && paired(m.as_str()).is_some());
            match margin {
                Some(margin) => vec![v.id.clone(), margin],
                None => vec![v.id.clone()],
            }
        })
        .collect()
}

/// One estimate request
#[derive(Debug, Clone)]
pub struct EstimateJob<'a> {
    pub geography: GeographyFilter,
    pub batch: &'a VariableBatch,
}

/// Lazily enumerate jobs state by state: counties first when requested, then
/// places, each crossed with every batch.
pub fn estimate_jobs<'a>(
    geography: &'a [StateWithChildren],
    batches: &'a [VariableBatch],
    include_counties: bool,
) -> impl Iterator<Item = EstimateJob<'a>> + 'a {
    geography.iter().flat_map(move |state| {
        let counties = state
            .counties
            .iter()
            .filter(move |_| include_counties)
            .map(move |county| GeographyFilter::county(&state.fips, &county.fips));
        let places = state
            .places
            .iter()
            .map(move |place| GeographyFilter::place(&state.fips, &place.fips));

        counties.chain(places).flat_map(move |filter| {
            batches.iter().map(move |batch| EstimateJob {
                geography: filter.clone(),
                batch,
            })
        })
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EstimateStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rows_written: u64,
}

pub struct EstimateScheduler {
    upstream: Upstream,
    store: Arc<dyn CensusStore>,
    storage: WorkerPool,
    window: usize,
}

impl EstimateScheduler {
    pub fn new(
        upstream: Upstream,
        store: Arc<dyn CensusStore>,
        storage: WorkerPool,
        window: usize,
    ) -> Self {
        Self {
            upstream,
            store,
            storage,
            window: window.max(1),
        }
    }

    /// Run every job for one (dataset, year). Returns once the job stream is
    /// exhausted and the window has drained.
    pub async fn run(
        &self,
        dataset: &Dataset,
        year: i32,
        year_id: i64,
        geography: &[StateWithChildren],
        batches: &[VariableBatch],
        include_counties: bool,
    ) -> EstimateStats {
        let started = Instant::now();
        info!(
            dataset = %dataset.id,
            year,
            batches = batches.len(),
            window = self.window,
            include_counties,
            "Streaming estimate jobs"
        );

        let stats = stream::iter(estimate_jobs(geography, batches, include_counties))
            .map(|job| async move {
                let outcome = self.run_job(dataset, year, year_id, &job).await;
                if let Err(ref e) = outcome {
                    error!(
                        dataset = %dataset.id,
                        year,
                        state = %job.geography.state_fips,
                        county = job.geography.county_fips.as_deref().unwrap_or("-"),
                        place = job.geography.place_fips.as_deref().unwrap_or("-"),
                        group_id = %job.batch.group_id,
                        first_variable = job.batch.variable_ids.first().map(String::as_str).unwrap_or("-"),
                        last_variable = job.batch.variable_ids.last().map(String::as_str).unwrap_or("-"),
                        variables = job.batch.variable_ids.len(),
                        attempts = e.attempts(),
                        error = %e,
                        "Estimate job failed"
                    );
                }
                outcome
            })
            .buffer_unordered(self.window)
            .fold(EstimateStats::default(), |mut stats, outcome| async move {
                stats.submitted += 1;
                match outcome {
                    Ok(rows) => {
                        stats.succeeded += 1;
                        stats.rows_written += rows;
                    },
                    Err(_) => stats.failed += 1,
                }
                if stats.submitted % 1000 == 0 {
                    info!(
                        completed = stats.submitted,
                        failed = stats.failed,
                        rows = stats.rows_written,
                        "Estimate progress"
                    );
                }
                stats
            })
            .await;

        info!(
            dataset = %dataset.id,
            year,
            jobs = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            rows = stats.rows_written,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Estimate jobs complete"
        );
        stats
    }

    /// Fetch one batch for one unit, then write it; the write happens after the fetch
    async fn run_job(
        &self,
        dataset: &Dataset,
        year: i32,
        year_id: i64,
        job: &EstimateJob<'_>,
    ) -> Result<u64> {
        let label = format!("fetch_estimates {}", job.geography);
        let rows = self
            .upstream
            .call(&label, |source| {
                source.fetch_estimates(dataset, year, &job.batch.variable_ids, &job.geography)
            })
            .await?;

        let records: Vec<EstimateRecord> = rows
            .into_iter()
            .flat_map(|row| row.into_records(&job.geography, &dataset.id, year_id))
            .collect();
        if records.is_empty() {
            return Ok(0);
        }

        let written = self
            .storage
            .run("insert_estimates", self.store.insert_estimates(&records))
            .await?;
        debug!(geography = %job.geography, group_id = %job.batch.group_id, rows = written, "Stored estimates");
        Ok(written)
    }
}
