//! HTTP client for the Census Bureau ACS API
//!
//! Endpoints (relative to the base URL, `https://api.census.gov/data`):
//!
//! - groups: `/{year}/acs/acs5/groups.json`
//! - variables: `/{year}/acs/acs5/groups/{group}.json`
//! - geography: `/{year}/acs/acs5?get=NAME&for=county:*&in=state:01`
//! - estimates: `/{year}/acs/acs5?get=B01001_001E,...&for=place:07000&in=state:01`
//!
//! Table endpoints answer with a JSON array of rows, the first row being the
//! column names. Years come from the HTML announcement pages instead.

use async_trait::async_trait;
use census_common::types::{
    Dataset, EstimateRow, EstimateValue, Frequency, GeographyFilter, GeographyScope,
    GeographyUnit, Group, Variable,
};
use census_common::{CensusError, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::cache::{CachedResponse, ResponseCache};
use super::{filter_by_name, years, CensusSource, MAX_VARIABLES_PER_REQUEST};

pub const DEFAULT_API_BASE_URL: &str = "https://api.census.gov/data";
pub const DEFAULT_ACS1_PAGE_URL: &str =
    "https://www.census.gov/data/developers/data-sets/acs-1year.html";
pub const DEFAULT_ACS5_PAGE_URL: &str =
    "https://www.census.gov/data/developers/data-sets/acs-5year.html";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const USER_AGENT: &str = concat!("census-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct AcsClientConfig {
    pub base_url: String,
    /// Sent as the `key` query parameter when present
    pub api_key: Option<String>,
    pub acs1_page_url: String,
    pub acs5_page_url: String,
    pub timeout: Duration,
}

impl Default for AcsClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            acs1_page_url: DEFAULT_ACS1_PAGE_URL.to_string(),
            acs5_page_url: DEFAULT_ACS5_PAGE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct VariablesResponse {
    variables: BTreeMap<String, VariableEntry>,
}

#[derive(Debug, Deserialize)]
struct VariableEntry {
    #[serde(default)]
    label: String,
}

/// Header plus data rows of a table response
struct Table {
    url: String,
    header: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    fn parse(url: &str, raw: Vec<Vec<Value>>) -> Result<Self> {
        let mut raw = raw.into_iter();
        let header = raw
            .next()
            .ok_or_else(|| api_error(url, None, "empty table response"))?
            .into_iter()
            .map(|cell| cell_text(cell).unwrap_or_default())
            .collect();
        let rows = raw
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect();

        Ok(Self {
            url: url.to_string(),
            header,
            rows,
        })
    }

    fn empty(url: &str) -> Self {
        Self {
            url: url.to_string(),
            header: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn column(&self, name: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| api_error(&self.url, None, &format!("missing column '{}'", name)))
    }

    fn optional_column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

fn cell_text(cell: Value) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn cell(row: &[Option<String>], index: usize) -> Option<String> {
    row.get(index).cloned().flatten()
}

fn api_error(url: &str, status: Option<StatusCode>, message: &str) -> CensusError {
    CensusError::SourceApi {
        url: url.to_string(),
        status: status.map(|s| s.as_u16()),
        message: message.to_string(),
    }
}

fn unavailable(url: &str, err: reqwest::Error) -> CensusError {
    CensusError::SourceUnavailable {
        url: url.to_string(),
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Census Bureau client with an injectable response cache
pub struct AcsClient {
    http: Client,
    config: AcsClientConfig,
    cache: Arc<ResponseCache>,
}

impl AcsClient {
    pub fn new(config: AcsClientConfig) -> Result<Self> {
        Self::with_cache(config, Arc::new(ResponseCache::default()))
    }

    pub fn with_cache(config: AcsClientConfig, cache: Arc<ResponseCache>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CensusError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            cache,
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    fn dataset_url(&self, dataset: &Dataset, year: i32) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            year,
            dataset.code,
            dataset.id
        )
    }

    fn with_key(&self, mut query: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(ref key) = self.config.api_key {
            query.push(("key", key.clone()));
        }
        query
    }

    /// GET and decode JSON; `None` for 204 No Content
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: Vec<(&'static str, String)>,
    ) -> Result<Option<T>> {
        debug!(url, "Census API request");

        let response = self
            .http
            .get(url)
            .query(&self.with_key(query))
            .send()
            .await
            .map_err(|e| unavailable(url, e))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = body.trim().chars().take(200).collect::<String>();
            return Err(api_error(url, Some(status), &message));
        }

        let body = response.text().await.map_err(|e| unavailable(url, e))?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| api_error(url, Some(status), &format!("malformed JSON: {}", e)))
    }

    async fn get_table(&self, url: &str, query: Vec<(&'static str, String)>) -> Result<Table> {
        match self.get_json::<Vec<Vec<Value>>>(url, query).await? {
            Some(raw) => Table::parse(url, raw),
            None => Ok(Table::empty(url)),
        }
    }

    /// Cached unfiltered geography listing for one level
    async fn geography(
        &self,
        dataset: &Dataset,
        year: i32,
        level: GeographyScope,
        state_fips: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let cache_key = format!(
            "{}:{}:{}:{}",
            level.as_str(),
            dataset.id,
            year,
            state_fips.unwrap_or("*")
        );
        if let Some(CachedResponse::Geography(units)) = self.cache.get(&cache_key) {
            return Ok(units);
        }

        let url = self.dataset_url(dataset, year);
        let mut query = vec![
            ("get", "NAME".to_string()),
            ("for", format!("{}:*", level.as_str())),
        ];
        if let Some(state) = state_fips {
            query.push(("in", format!("state:{}", state)));
        }
        let table = self.get_table(&url, query).await?;

        let units = if table.header.is_empty() {
            Vec::new()
        } else {
            let name_col = table.column("NAME")?;
            let fips_col = table.column(level.as_str())?;
            let parent_col = match level {
                GeographyScope::State => None,
                GeographyScope::County | GeographyScope::Place => Some(table.column("state")?),
            };
            table
                .rows
                .iter()
                .filter_map(|row| {
                    Some(GeographyUnit {
                        name: cell(row, name_col)?,
                        fips: cell(row, fips_col)?,
                        parent_fips: parent_col.and_then(|c| cell(row, c)),
                    })
                })
                .collect::<Vec<_>>()
        };

        debug!(
            dataset = %dataset.id,
            year,
            level = level.as_str(),
            state = state_fips.unwrap_or("*"),
            count = units.len(),
            "Fetched geography"
        );
        self.cache.insert(cache_key, CachedResponse::Geography(units.clone()));
        Ok(units)
    }
}

#[async_trait]
impl CensusSource for AcsClient {
    async fn fetch_years(&self, frequency: Frequency) -> Result<Vec<i32>> {
        let url = match frequency {
            Frequency::Annual => &self.config.acs1_page_url,
            Frequency::Quinquennial => &self.config.acs5_page_url,
        };

        let response = self.http.get(url).send().await.map_err(|e| unavailable(url, e))?;
        if response.status() != StatusCode::OK {
            return Err(CensusError::SourceUnavailable {
                url: url.clone(),
                status: Some(response.status().as_u16()),
                message: format!("announcement page returned {}", response.status()),
            });
        }
        let html = response.text().await.map_err(|e| unavailable(url, e))?;

        let years = years::parse_year_range(&html)?;
        info!(frequency = %frequency, first = ?years.first(), last = ?years.last(), "Discovered ACS years");
        Ok(years)
    }

    async fn fetch_groups(&self, dataset: &Dataset, year: i32) -> Result<Vec<Group>> {
        let cache_key = format!("groups:{}:{}", dataset.id, year);
        if let Some(CachedResponse::Groups(groups)) = self.cache.get(&cache_key) {
            return Ok(groups);
        }

        let url = format!("{}/groups.json", self.dataset_url(dataset, year));
        let response: GroupsResponse = self
            .get_json(&url, Vec::new())
            .await?
            .ok_or_else(|| api_error(&url, Some(StatusCode::NO_CONTENT), "no group catalog"))?;

        let groups: Vec<Group> = response
            .groups
            .into_iter()
            .map(|g| Group {
                id: g.name,
                description: g.description,
                variable_count: 0,
            })
            .collect();

        self.cache.insert(cache_key, CachedResponse::Groups(groups.clone()));
        Ok(groups)
    }

    async fn fetch_variables(
        &self,
        dataset: &Dataset,
        year: i32,
        group_id: &str,
    ) -> Result<Vec<Variable>> {
        let cache_key = format!("variables:{}:{}:{}", dataset.id, year, group_id);
        if let Some(CachedResponse::Variables(variables)) = self.cache.get(&cache_key) {
            return Ok(variables);
        }

        let url = format!("{}/groups/{}.json", self.dataset_url(dataset, year), group_id);
        let variables: Vec<Variable> = self
            .get_json::<VariablesResponse>(&url, Vec::new())
            .await?
            .map(|r| {
                r.variables
                    .into_iter()
                    .map(|(id, v)| Variable {
                        id,
                        description: v.label,
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.cache
            .insert(cache_key, CachedResponse::Variables(variables.clone()));
        Ok(variables)
    }

    async fn fetch_states(
        &self,
        dataset: &Dataset,
        year: i32,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let states = self.geography(dataset, year, GeographyScope::State, None).await?;
        filter_by_name(states, name, "state")
    }

    async fn fetch_counties(
        &self,
        dataset: &Dataset,
        year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let counties = self
            .geography(dataset, year, GeographyScope::County, Some(state_fips))
            .await?;
        filter_by_name(counties, name, "county")
    }

    async fn fetch_places(
        &self,
        dataset: &Dataset,
        year: i32,
        state_fips: &str,
        name: Option<&str>,
    ) -> Result<Vec<GeographyUnit>> {
        let places = self
            .geography(dataset, year, GeographyScope::Place, Some(state_fips))
            .await?;
        filter_by_name(places, name, "place")
    }

    async fn fetch_estimates(
        &self,
        dataset: &Dataset,
        year: i32,
        variable_ids: &[String],
        geography: &GeographyFilter,
    ) -> Result<Vec<EstimateRow>> {
        let scope = geography.scope()?;
        if variable_ids.is_empty() || variable_ids.len() > MAX_VARIABLES_PER_REQUEST {
            return Err(CensusError::InvalidVariableBatch {
                requested: variable_ids.len(),
                limit: MAX_VARIABLES_PER_REQUEST,
            });
        }

        let url = self.dataset_url(dataset, year);
        let mut query = vec![("get", variable_ids.join(","))];
        match scope {
            GeographyScope::State => {
                query.push(("for", format!("state:{}", geography.state_fips)));
            },
            GeographyScope::County => {
                let county = geography.county_fips.as_deref().unwrap_or_default();
                query.push(("for", format!("county:{}", county)));
                query.push(("in", format!("state:{}", geography.state_fips)));
            },
            GeographyScope::Place => {
                let place = geography.place_fips.as_deref().unwrap_or_default();
                query.push(("for", format!("place:{}", place)));
                query.push(("in", format!("state:{}", geography.state_fips)));
            },
        }

        let table = self.get_table(&url, query).await?;
        if table.header.is_empty() {
            return Ok(Vec::new());
        }

        let columns = variable_ids
            .iter()
            .map(|id| table.column(id))
            .collect::<Result<Vec<_>>>()?;
        let state_col = table.optional_column("state");
        let county_col = table.optional_column("county");
        let place_col = table.optional_column("place");

        let rows = table
            .rows
            .iter()
            .map(|row| EstimateRow {
                state_fips: state_col
                    .and_then(|c| cell(row, c))
                    .unwrap_or_else(|| geography.state_fips.clone()),
                county_fips: county_col
                    .and_then(|c| cell(row, c))
                    .or_else(|| geography.county_fips.clone()),
                place_fips: place_col
                    .and_then(|c| cell(row, c))
                    .or_else(|| geography.place_fips.clone()),
                values: variable_ids
                    .iter()
                    .zip(&columns)
                    .map(|(id, &c)| EstimateValue {
                        variable_id: id.clone(),
                        raw_value: cell(row, c),
                    })
                    .collect(),
            })
            .collect();

        Ok(rows)
    }
}
