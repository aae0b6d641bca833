//! In-process store with the same natural-key uniqueness as the Postgres schema
//!
//! Backs `--dry-run` ingestion and the pipeline tests.

use async_trait::async_trait;
use census_common::types::{
    AvailableYear, Dataset, EstimateRecord, GeographyFilter, GeographyUnit, Group,
    IngestionCheckpoint, Stage, Variable, VariableRecord,
};
use census_common::{CensusError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{fips_key, CensusStore, CheckpointRepository};

type YearKey = (String, i64);
/// (place, state, county, dataset, year_id, variable), mirroring the estimate primary key
type EstimateKey = (String, String, String, String, i64, String);

#[derive(Debug, Default)]
struct Tables {
    datasets: BTreeMap<String, Dataset>,
    years: BTreeMap<(String, i32), i64>,
    next_year_id: i64,
    groups: BTreeMap<(YearKey, String), Group>,
    variables: BTreeMap<(YearKey, String, String), Variable>,
    states: BTreeMap<(YearKey, String), GeographyUnit>,
    counties: BTreeMap<(YearKey, String, String), GeographyUnit>,
    places: BTreeMap<(YearKey, String, String), GeographyUnit>,
    estimates: BTreeMap<EstimateKey, EstimateRecord>,
    checkpoints: BTreeMap<(String, i32), IngestionCheckpoint>,
}

/// Insert `value` unless `key` exists; true when inserted
fn insert_new<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V) -> bool {
    match map.entry(key) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(value);
            true
        },
        std::collections::btree_map::Entry::Occupied(_) => false,
    }
}

fn name_matches(unit: &GeographyUnit, name: Option<&str>) -> bool {
    name.map_or(true, |n| unit.name == n)
}

fn child_parent(unit: &GeographyUnit, level: &str) -> Result<String> {
    unit.parent_fips.clone().ok_or_else(|| {
        CensusError::Database(format!("{} {} has no state FIPS", level, unit.fips))
    })
}

/// Cloneable handle; clones share the same tables
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| CensusError::Internal(format!("Failed to acquire store lock: {}", e)))
    }

    pub fn estimate_count(&self) -> usize {
        self.lock().map(|t| t.estimates.len()).unwrap_or(0)
    }

    pub fn variable_count(&self) -> usize {
        self.lock().map(|t| t.variables.len()).unwrap_or(0)
    }

    pub fn group_count(&self) -> usize {
        self.lock().map(|t| t.groups.len()).unwrap_or(0)
    }

    pub fn state_count(&self) -> usize {
        self.lock().map(|t| t.states.len()).unwrap_or(0)
    }

    pub fn county_count(&self) -> usize {
        self.lock().map(|t| t.counties.len()).unwrap_or(0)
    }

    pub fn place_count(&self) -> usize {
        self.lock().map(|t| t.places.len()).unwrap_or(0)
    }

    /// Every stored estimate, in primary-key order
    pub fn all_estimates(&self) -> Vec<EstimateRecord> {
        self.lock()
            .map(|t| t.estimates.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CensusStore for MemoryStore {
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut tables = self.lock()?;
        insert_new(&mut tables.datasets, dataset.id.clone(), dataset.clone());
        Ok(())
    }

    async fn ensure_year(&self, dataset_id: &str, year: i32) -> Result<i64> {
        let mut tables = self.lock()?;
        if !tables.datasets.contains_key(dataset_id) {
            return Err(CensusError::NotFound(format!("dataset {}", dataset_id)));
        }
        if let Some(id) = tables.years.get(&(dataset_id.to_string(), year)) {
            return Ok(*id);
        }
        tables.next_year_id += 1;
        let id = tables.next_year_id;
        tables.years.insert((dataset_id.to_string(), year), id);
        Ok(id)
    }

    async fn year_id(&self, dataset_id: &str, year: i32) -> Result<Option<i64>> {
        Ok(self.lock()?.years.get(&(dataset_id.to_string(), year)).copied())
    }

    async fn list_years(&self, dataset_id: &str) -> Result<Vec<AvailableYear>> {
        Ok(self
            .lock()?
            .years
            .iter()
            .filter(|((dataset, _), _)| dataset == dataset_id)
            .map(|((dataset, year), id)| AvailableYear {
                id: *id,
                dataset_id: dataset.clone(),
                year: *year,
            })
            .collect())
    }

    async fn insert_groups(&self, dataset_id: &str, year_id: i64, groups: &[Group]) -> Result<u64> {
        let mut tables = self.lock()?;
        let key = (dataset_id.to_string(), year_id);
        Ok(groups
            .iter()
            .filter(|g| insert_new(&mut tables.groups, (key.clone(), g.id.clone()), (*g).clone()))
            .count() as u64)
    }

    async fn insert_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        variables: &[VariableRecord],
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let key = (dataset_id.to_string(), year_id);
        Ok(variables
            .iter()
            .filter(|v| {
                insert_new(
                    &mut tables.variables,
                    (key.clone(), v.group_id.clone(), v.variable.id.clone()),
                    v.variable.clone(),
                )
            })
            .count() as u64)
    }

    async fn insert_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        states: &[GeographyUnit],
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let key = (dataset_id.to_string(), year_id);
        Ok(states
            .iter()
            .filter(|s| insert_new(&mut tables.states, (key.clone(), s.fips.clone()), (*s).clone()))
            .count() as u64)
    }

    async fn insert_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        counties: &[GeographyUnit],
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let key = (dataset_id.to_string(), year_id);
        let mut inserted = 0;
        for county in counties {
            let state = child_parent(county, "county")?;
            if insert_new(
                &mut tables.counties,
                (key.clone(), state, county.fips.clone()),
                county.clone(),
            ) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        places: &[GeographyUnit],
    ) -> Result<u64> {
        let mut tables = self.lock()?;
        let key = (dataset_id.to_string(), year_id);
        let mut inserted = 0;
        for place in places {
            let state = child_parent(place, "place")?;
            if insert_new(
                &mut tables.places,
                (key.clone(), state, place.fips.clone()),
                place.clone(),
            ) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_estimates(&self, records: &[EstimateRecord]) -> Result<u64> {
        let mut tables = self.lock()?;
        Ok(records
            .iter()
            .filter(|r| {
                let key = (
                    fips_key(&r.place_fips),
                    r.state_fips.clone(),
                    fips_key(&r.county_fips),
                    r.dataset_id.clone(),
                    r.year_id,
                    r.variable_id.clone(),
                );
                insert_new(&mut tables.estimates, key, (*r).clone())
            })
            .count() as u64)
    }

    async fn get_groups(&self, dataset_id: &str, year_id: i64) -> Result<Vec<Group>> {
        let key = (dataset_id.to_string(), year_id);
        Ok(self
            .lock()?
            .groups
            .iter()
            .filter(|((k, _), _)| *k == key)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn get_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        group_id: &str,
    ) -> Result<Vec<Variable>> {
        let key = (dataset_id.to_string(), year_id);
        Ok(self
            .lock()?
            .variables
            .iter()
            .filter(|((k, group, _), _)| *k == key && group == group_id)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let key = (dataset_id.to_string(), year_id);
        Ok(self
            .lock()?
            .states
            .iter()
            .filter(|((k, _), s)| *k == key && name_matches(s, name))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn get_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let key = (dataset_id.to_string(), year_id);
        Ok(self
            .lock()?
            .counties
            .iter()
            .filter(|((k, state, _), c)| *k == key && state == state_fips && name_matches(c, name))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let key = (dataset_id.to_string(), year_id);
        Ok(self
            .lock()?
            .places
            .iter()
            .filter(|((k, state, _), p)| *k == key && state == state_fips && name_matches(p, name))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_estimates(
        &self,
        dataset_id: &str,
        year_id: i64,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> Result<Vec<EstimateRecord>> {
        let place = fips_key(&geography.place_fips);
        let county = fips_key(&geography.county_fips);
        Ok(self
            .lock()?
            .estimates
            .iter()
            .filter(|((p, s, c, d, y, v), _)| {
                *p == place
                    && *s == geography.state_fips
                    && *c == county
                    && d == dataset_id
                    && *y == year_id
                    && variable_ids.contains(v)
            })
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[async_trait]
impl CheckpointRepository for MemoryStore {
    async fn load_checkpoint(
        &self,
        dataset_id: &str,
        year: i32,
    ) -> Result<Option<IngestionCheckpoint>> {
        Ok(self
            .lock()?
            .checkpoints
            .get(&(dataset_id.to_string(), year))
            .cloned())
    }

    async fn insert_checkpoint_if_absent(&self, dataset_id: &str, year: i32) -> Result<()> {
        let mut tables = self.lock()?;
        insert_new(
            &mut tables.checkpoints,
            (dataset_id.to_string(), year),
            IngestionCheckpoint::new(dataset_id, year),
        );
        Ok(())
    }

    async fn set_checkpoint_flag(&self, dataset_id: &str, year: i32, stage: Stage) -> Result<()> {
        let mut tables = self.lock()?;
        tables
            .checkpoints
            .get_mut(&(dataset_id.to_string(), year))
            .ok_or_else(|| {
                CensusError::NotFound(format!("checkpoint for {} {}", dataset_id, year))
            })?
            .mark(stage);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record(variable: &str, place: Option<&str>) -> EstimateRecord {
        EstimateRecord {
            variable_id: variable.to_string(),
            group_id: "B01001".to_string(),
            state_fips: "01".to_string(),
            county_fips: None,
            place_fips: place.map(str::to_string),
            dataset_id: "acs5".to_string(),
            year_id: 1,
            value: Some(1.0),
            margin_of_error: None,
        }
    }

    #[tokio::test]
    async fn test_year_ids_are_stable() {
        let store = MemoryStore::new();
        store.insert_dataset(&Dataset::acs5()).await.unwrap();

        let first = store.ensure_year("acs5", 2019).await.unwrap();
        let again = store.ensure_year("acs5", 2019).await.unwrap();
        let other = store.ensure_year("acs5", 2020).await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(store.list_years("acs5").await.unwrap().len(), 2);
        assert!(store.ensure_year("acs1", 2019).await.is_err());
    }

    #[tokio::test]
    async fn test_estimates_ignore_duplicate_keys() {
        let store = MemoryStore::new();
        let batch = vec![record("B01001_001E", Some("07000")), record("B01001_002E", Some("07000"))];

        assert_eq!(store.insert_estimates(&batch).await.unwrap(), 2);
        assert_eq!(store.insert_estimates(&batch).await.unwrap(), 0);
        assert_eq!(store.insert_estimates(&[record("B01001_001E", None)]).await.unwrap(), 1);
        assert_eq!(store.estimate_count(), 3);

        let found = store
            .get_estimates(
                "acs5",
                1,
                &["B01001_001E".to_string()],
                &GeographyFilter::place("01", "07000"),
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_counties_require_state() {
        let store = MemoryStore::new();
        let orphan = GeographyUnit {
            name: "Autauga County, Alabama".to_string(),
            fips: "001".to_string(),
            parent_fips: None,
        };

        assert!(store.insert_counties("acs5", 1, &[orphan]).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_flags() {
        let store = MemoryStore::new();
        assert!(store.set_checkpoint_flag("acs5", 2019, Stage::Groups).await.is_err());

        store.insert_checkpoint_if_absent("acs5", 2019).await.unwrap();
        store.set_checkpoint_flag("acs5", 2019, Stage::Groups).await.unwrap();
        store.insert_checkpoint_if_absent("acs5", 2019).await.unwrap();

        let checkpoint = store.load_checkpoint("acs5", 2019).await.unwrap().unwrap();
        assert!(checkpoint.groups_ingested);
        assert!(!checkpoint.variables_ingested);
    }
}
