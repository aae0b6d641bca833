//! Group and variable catalog loading

use census_common::types::{Dataset, Group, Variable, VariableRecord};
use census_common::{CensusError, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::Upstream;

/// Default number of groups whose variables load at once
pub const DEFAULT_GROUP_CONCURRENCY: usize = 8;

/// Groups of one (dataset, year) with their variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataCatalog {
    /// `variable_count` reflects the loaded variables
    pub groups: Vec<Group>,
    pub variables_by_group: BTreeMap<String, Vec<Variable>>,
}

impl MetadataCatalog {
    pub fn variable_records(&self) -> Vec<VariableRecord> {
        self.variables_by_group
            .iter()
            .flat_map(|(group_id, variables)| {
                variables.iter().map(move |variable| VariableRecord {
                    group_id: group_id.clone(),
                    variable: variable.clone(),
                })
            })
            .collect()
    }

    pub fn variable_count(&self) -> usize {
        self.variables_by_group.values().map(Vec::len).sum()
    }
}

pub struct MetadataLoader {
    upstream: Upstream,
    group_concurrency: usize,
}

impl MetadataLoader {
    pub fn new(upstream: Upstream, group_concurrency: usize) -> Self {
        Self {
            upstream,
            group_concurrency: group_concurrency.max(1),
        }
    }

    /// Fetch the group list once, narrow it to `allowed_groups` when given, then
    /// fetch every group's variables with bounded concurrency.
    pub async fn load(
        &self,
        dataset: &Dataset,
        year: i32,
        allowed_groups: Option<&[String]>,
    ) -> Result<MetadataCatalog> {
        let started = Instant::now();

        let mut groups = self
            .upstream
            .call("fetch_groups", |source| source.fetch_groups(dataset, year))
            .await?;
        let offered = groups.len();

        if let Some(allowed) = allowed_groups {
            let allowed: BTreeSet<&str> = allowed.iter().map(String::as_str).collect();
            groups.retain(|g| allowed.contains(g.id.as_str()));
            for missing in allowed
                .iter()
                .filter(|id| !groups.iter().any(|g| g.id == **id))
            {
                warn!(dataset = %dataset.id, year, group_id = missing, "Allowed group not offered upstream");
            }
        }

        info!(
            dataset = %dataset.id,
            year,
            offered,
            selected = groups.len(),
            "Loaded group catalog"
        );

        let variables_by_group: BTreeMap<String, Vec<Variable>> =
            stream::iter(groups.iter().map(|g| g.id.clone()))
                .map(|group_id| async move {
                    let label = format!("fetch_variables {}", group_id);
                    let variables = self
                        .upstream
                        .call(&label, |source| source.fetch_variables(dataset, year, &group_id))
                        .await?;
                    debug!(dataset = %dataset.id, year, group_id = %group_id, count = variables.len(), "Loaded variables");
                    Ok::<_, CensusError>((group_id, variables))
                })
                .buffer_unordered(self.group_concurrency)
                .try_collect()
                .await?;

        for group in &mut groups {
            group.variable_count = variables_by_group
                .get(&group.id)
                .map_or(0, |v| v.len() as u32);
        }

        let catalog = MetadataCatalog {
            groups,
            variables_by_group,
        };
        info!(
            dataset = %dataset.id,
            year,
            groups = catalog.groups.len(),
            variables = catalog.variable_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded variable catalog"
        );
        Ok(catalog)
    }
}
