//! Postgres store (sqlx)
//!
//! Inserts are chunked into multi-row `INSERT ... ON CONFLICT DO NOTHING`
//! statements; the schema lives in `migrations/`.

use async_trait::async_trait;
use census_common::types::{
    AvailableYear, Dataset, EstimateRecord, GeographyFilter, GeographyUnit, Group,
    IngestionCheckpoint, Stage, Variable, VariableRecord,
};
use census_common::{CensusError, Result};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use super::{fips_from_key, fips_key, CensusStore, CheckpointRepository, DEFAULT_STORAGE_BATCH_SIZE};

/// Apply the bundled migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(CensusError::database)
}

#[derive(Debug, Clone)]
pub struct PgCensusStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgCensusStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_STORAGE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute(&self, mut builder: QueryBuilder<'_, Postgres>) -> Result<u64> {
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(CensusError::database)?;
        Ok(result.rows_affected())
    }

    async fn insert_children(
        &self,
        table: &str,
        dataset_id: &str,
        year_id: i64,
        units: &[GeographyUnit],
    ) -> Result<u64> {
        let mut rows = Vec::with_capacity(units.len());
        for unit in units {
            let state = unit.parent_fips.as_deref().ok_or_else(|| {
                CensusError::Database(format!("{} row {} has no state FIPS", table, unit.fips))
            })?;
            rows.push((unit, state));
        }

        let mut inserted = 0;
        for chunk in rows.chunks(self.batch_size) {
            let mut builder = QueryBuilder::new(format!(
                "INSERT INTO {} (fips, state_fips, dataset_id, year_id, name) ",
                table
            ));
            builder.push_values(chunk, |mut b, (unit, state)| {
                b.push_bind(&unit.fips)
                    .push_bind(*state)
                    .push_bind(dataset_id)
                    .push_bind(year_id)
                    .push_bind(&unit.name);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            inserted += self.execute(builder).await?;
        }
        debug!(table, dataset_id, year_id, inserted, "Inserted geography rows");
        Ok(inserted)
    }

    async fn get_children(
        &self,
        table: &str,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let sql = format!(
            "SELECT fips, state_fips, name FROM {} \
             WHERE dataset_id = $1 AND year_id = $2 AND state_fips = $3 \
             AND ($4::TEXT IS NULL OR name = $4) ORDER BY fips",
            table
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(year_id)
            .bind(state_fips)
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(CensusError::database)?;

        rows.iter()
            .map(|row| {
                Ok(GeographyUnit {
                    fips: row.try_get("fips").map_err(CensusError::database)?,
                    parent_fips: Some(row.try_get("state_fips").map_err(CensusError::database)?),
                    name: row.try_get("name").map_err(CensusError::database)?,
                })
            })
            .collect()
    }
}

fn checkpoint_from_row(row: &PgRow) -> Result<IngestionCheckpoint> {
    Ok(IngestionCheckpoint {
        dataset_id: row.try_get("dataset_id").map_err(CensusError::database)?,
        year: row.try_get("year").map_err(CensusError::database)?,
        groups_ingested: row.try_get("groups_ingested").map_err(CensusError::database)?,
        variables_ingested: row.try_get("variables_ingested").map_err(CensusError::database)?,
        geography_ingested: row.try_get("geography_ingested").map_err(CensusError::database)?,
        estimates_ingested: row.try_get("estimates_ingested").map_err(CensusError::database)?,
    })
}

fn estimate_from_row(row: &PgRow) -> Result<EstimateRecord> {
    Ok(EstimateRecord {
        variable_id: row.try_get("variable_id").map_err(CensusError::database)?,
        group_id: row.try_get("group_id").map_err(CensusError::database)?,
        state_fips: row.try_get("state_fips").map_err(CensusError::database)?,
        county_fips: fips_from_key(row.try_get("county_fips").map_err(CensusError::database)?),
        place_fips: fips_from_key(row.try_get("place_fips").map_err(CensusError::database)?),
        dataset_id: row.try_get("dataset_id").map_err(CensusError::database)?,
        year_id: row.try_get("year_id").map_err(CensusError::database)?,
        value: row.try_get("estimate").map_err(CensusError::database)?,
        margin_of_error: row.try_get("margin_of_error").map_err(CensusError::database)?,
    })
}

#[async_trait]
impl CensusStore for PgCensusStore {
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        sqlx::query(
            "INSERT INTO datasets (id, code, frequency) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&dataset.id)
        .bind(&dataset.code)
        .bind(dataset.frequency.as_str())
        .execute(&self.pool)
        .await
        .map_err(CensusError::database)?;
        Ok(())
    }

    async fn ensure_year(&self, dataset_id: &str, year: i32) -> Result<i64> {
        sqlx::query(
            "INSERT INTO available_years (dataset_id, year) VALUES ($1, $2) \
             ON CONFLICT (dataset_id, year) DO NOTHING",
        )
        .bind(dataset_id)
        .bind(year)
        .execute(&self.pool)
        .await
        .map_err(CensusError::database)?;

        self.year_id(dataset_id, year).await?.ok_or_else(|| {
            CensusError::Database(format!("year {} for {} vanished after insert", year, dataset_id))
        })
    }

    async fn year_id(&self, dataset_id: &str, year: i32) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM available_years WHERE dataset_id = $1 AND year = $2")
            .bind(dataset_id)
            .bind(year)
            .fetch_optional(&self.pool)
            .await
            .map_err(CensusError::database)?;

        row.map(|r| r.try_get("id").map_err(CensusError::database))
            .transpose()
    }

    async fn list_years(&self, dataset_id: &str) -> Result<Vec<AvailableYear>> {
        let rows = sqlx::query(
            "SELECT id, dataset_id, year FROM available_years WHERE dataset_id = $1 ORDER BY year",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CensusError::database)?;

        rows.iter()
            .map(|row| {
                Ok(AvailableYear {
                    id: row.try_get("id").map_err(CensusError::database)?,
                    dataset_id: row.try_get("dataset_id").map_err(CensusError::database)?,
                    year: row.try_get("year").map_err(CensusError::database)?,
                })
            })
            .collect()
    }

    async fn insert_groups(&self, dataset_id: &str, year_id: i64, groups: &[Group]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in groups.chunks(self.batch_size) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO census_groups (id, dataset_id, year_id, description, variable_count) ",
            );
            builder.push_values(chunk, |mut b, group| {
                b.push_bind(&group.id)
                    .push_bind(dataset_id)
                    .push_bind(year_id)
                    .push_bind(&group.description)
                    .push_bind(group.variable_count as i32);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            inserted += self.execute(builder).await?;
        }
        Ok(inserted)
    }

    async fn insert_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        variables: &[VariableRecord],
    ) -> Result<u64> {
        let mut inserted = 0;
        for chunk in variables.chunks(self.batch_size) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO census_variables (id, group_id, dataset_id, year_id, description) ",
            );
            builder.push_values(chunk, |mut b, record| {
                b.push_bind(&record.variable.id)
                    .push_bind(&record.group_id)
                    .push_bind(dataset_id)
                    .push_bind(year_id)
                    .push_bind(&record.variable.description);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            inserted += self.execute(builder).await?;
        }
        Ok(inserted)
    }

    async fn insert_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        states: &[GeographyUnit],
    ) -> Result<u64> {
        let mut inserted = 0;
        for chunk in states.chunks(self.batch_size) {
            let mut builder =
                QueryBuilder::new("INSERT INTO states (fips, dataset_id, year_id, name) ");
            builder.push_values(chunk, |mut b, state| {
                b.push_bind(&state.fips)
                    .push_bind(dataset_id)
                    .push_bind(year_id)
                    .push_bind(&state.name);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            inserted += self.execute(builder).await?;
        }
        Ok(inserted)
    }

    async fn insert_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        counties: &[GeographyUnit],
    ) -> Result<u64> {
        self.insert_children("counties", dataset_id, year_id, counties).await
    }

    async fn insert_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        places: &[GeographyUnit],
    ) -> Result<u64> {
        self.insert_children("places", dataset_id, year_id, places).await
    }

    async fn insert_estimates(&self, records: &[EstimateRecord]) -> Result<u64> {
        let mut inserted = 0;
        for chunk in records.chunks(self.batch_size) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO census_estimates (place_fips, state_fips, county_fips, dataset_id, \
                 year_id, variable_id, group_id, estimate, margin_of_error) ",
            );
            builder.push_values(chunk, |mut b, record| {
                b.push_bind(fips_key(&record.place_fips))
                    .push_bind(&record.state_fips)
                    .push_bind(fips_key(&record.county_fips))
                    .push_bind(&record.dataset_id)
                    .push_bind(record.year_id)
                    .push_bind(&record.variable_id)
                    .push_bind(&record.group_id)
                    .push_bind(record.value)
                    .push_bind(record.margin_of_error);
            });
            builder.push(" ON CONFLICT DO NOTHING");
            inserted += self.execute(builder).await?;
        }
        Ok(inserted)
    }

    async fn get_groups(&self, dataset_id: &str, year_id: i64) -> Result<Vec<Group>> {
        let rows = sqlx::query(
            "SELECT id, description, variable_count FROM census_groups \
             WHERE dataset_id = $1 AND year_id = $2 ORDER BY id",
        )
        .bind(dataset_id)
        .bind(year_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CensusError::database)?;

        rows.iter()
            .map(|row| {
                let count: i32 = row.try_get("variable_count").map_err(CensusError::database)?;
                Ok(Group {
                    id: row.try_get("id").map_err(CensusError::database)?,
                    description: row.try_get("description").map_err(CensusError::database)?,
                    variable_count: count.max(0) as u32,
                })
            })
            .collect()
    }

    async fn get_variables(
        &self,
        dataset_id: &str,
        year_id: i64,
        group_id: &str,
    ) -> Result<Vec<Variable>> {
        let rows = sqlx::query(
            "SELECT id, description FROM census_variables \
             WHERE dataset_id = $1 AND year_id = $2 AND group_id = $3 ORDER BY id",
        )
        .bind(dataset_id)
        .bind(year_id)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CensusError::database)?;

        rows.iter()
            .map(|row| {
                Ok(Variable {
                    id: row.try_get("id").map_err(CensusError::database)?,
                    description: row.try_get("description").map_err(CensusError::database)?,
                })
            })
            .collect()
    }

    async fn get_states(
        &self,
        dataset_id: &str,
        year_id: i64,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let rows = sqlx::query(
            "SELECT fips, name FROM states WHERE dataset_id = $1 AND year_id = $2 \
             AND ($3::TEXT IS NULL OR name = $3) ORDER BY fips",
        )
        .bind(dataset_id)
        .bind(year_id)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(CensusError::database)?;

        rows.iter()
            .map(|row| {
                Ok(GeographyUnit {
                    fips: row.try_get("fips").map_err(CensusError::database)?,
                    name: row.try_get("name").map_err(CensusError::database)?,
                    parent_fips: None,
                })
            })
            .collect()
    }

    async fn get_counties(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        self.get_children("counties", dataset_id, year_id, state_fips, name)
            .await
    }

    async fn get_places(
        &self,
        dataset_id: &str,
        year_id: i64,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        self.get_children("places", dataset_id, year_id, state_fips, name)
            .await
    }

    async fn get_estimates(
        &self,
        dataset_id: &str,
        year_id: i64,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> Result<Vec<EstimateRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM census_estimates \
             WHERE dataset_id = $1 AND year_id = $2 AND state_fips = $3 \
             AND county_fips = $4 AND place_fips = $5 AND variable_id = ANY($6) \
             ORDER BY variable_id",
        )
        .bind(dataset_id)
        .bind(year_id)
        .bind(&geography.state_fips)
        .bind(fips_key(&geography.county_fips))
        .bind(fips_key(&geography.place_fips))
        .bind(variable_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(CensusError::database)?;

        rows.iter().map(estimate_from_row).collect()
    }
}

#[async_trait]
impl CheckpointRepository for PgCensusStore {
    async fn load_checkpoint(
        &self,
        dataset_id: &str,
        year: i32,
    ) -> Result<Option<IngestionCheckpoint>> {
        let row = sqlx::query(
            "SELECT dataset_id, year, groups_ingested, variables_ingested, \
             geography_ingested, estimates_ingested \
             FROM ingestion_checkpoints WHERE dataset_id = $1 AND year = $2",
        )
        .bind(dataset_id)
        .bind(year)
        .fetch_optional(&self.pool)
        .await
        .map_err(CensusError::database)?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn insert_checkpoint_if_absent(&self, dataset_id: &str, year: i32) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_checkpoints (dataset_id, year) VALUES ($1, $2) \
             ON CONFLICT (dataset_id, year) DO NOTHING",
        )
        .bind(dataset_id)
        .bind(year)
        .execute(&self.pool)
        .await
        .map_err(CensusError::database)?;
        Ok(())
    }

    async fn set_checkpoint_flag(&self, dataset_id: &str, year: i32, stage: Stage) -> Result<()> {
        // Column name comes from the closed Stage enum, never from input
        let sql = format!(
            "UPDATE ingestion_checkpoints SET {} = TRUE, updated_at = NOW() \
             WHERE dataset_id = $1 AND year = $2",
            stage.as_str()
        );
        let result = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(year)
            .execute(&self.pool)
            .await
            .map_err(CensusError::database)?;

        if result.rows_affected() == 0 {
            return Err(CensusError::NotFound(format!(
                "checkpoint for {} {}",
                dataset_id, year
            )));
        }
        Ok(())
    }
}
