//! Configuration management
//!
//! Everything is read from the environment (and a `.env` file when present).
//! None of these values change what gets stored, only how fast.

use census_common::types::Dataset;
use std::time::Duration;

use crate::client::acs::{
    DEFAULT_ACS1_PAGE_URL, DEFAULT_ACS5_PAGE_URL, DEFAULT_API_BASE_URL, DEFAULT_HTTP_TIMEOUT_SECS,
};
use crate::client::cache::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};
use crate::client::{AcsClientConfig, MAX_VARIABLES_PER_REQUEST};
use crate::estimates::DEFAULT_WINDOW_MULTIPLIER;
use crate::loaders::geography::DEFAULT_GEOGRAPHY_CONCURRENCY;
use crate::loaders::metadata::DEFAULT_GROUP_CONCURRENCY;
use crate::orchestrator::{
    IngestOptions, DEFAULT_CALL_TIMEOUT, DEFAULT_NETWORK_CONCURRENCY, DEFAULT_STORAGE_CONCURRENCY,
};
use crate::retry::{RetryPolicy, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_RETRIES};
use crate::storage::DEFAULT_STORAGE_BATCH_SIZE;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/census";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_DATASETS: &str = "acs5";
pub const DEFAULT_YEARS: &str = "2019,2024";

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub acs1_page_url: String,
    pub acs5_page_url: String,
    pub http_timeout_secs: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub network_concurrency: usize,
    pub storage_concurrency: usize,
    pub group_concurrency: usize,
    pub geography_concurrency: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// 0 disables the per-call timeout
    pub call_timeout_secs: u64,
    pub vars_per_request: usize,
    pub window_multiplier: usize,
    pub storage_batch_size: usize,
    pub place_only: bool,
    /// Dataset ids such as `acs1` or `acs5`
    pub datasets: Vec<String>,
    pub years: Vec<i32>,
    /// `None` means every group
    pub allowed_groups: Option<Vec<String>>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| split_list(&raw))
}

/// Split a comma-separated value, dropping blanks
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `2019,2021` or an inclusive range `2019-2021`
pub fn parse_years(raw: &str) -> anyhow::Result<Vec<i32>> {
    let mut years = Vec::new();
    for part in split_list(raw) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: i32 = start.trim().parse()?;
                let end: i32 = end.trim().parse()?;
                if start > end {
                    anyhow::bail!("Year range {} is reversed", part);
                }
                years.extend(start..=end);
            },
            None => years.push(part.parse()?),
        }
    }
    Ok(years)
}

impl IngestConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let years = match std::env::var("CENSUS_YEARS") {
            Ok(raw) => parse_years(&raw)
                .map_err(|e| anyhow::anyhow!("Invalid CENSUS_YEARS '{}': {}", raw, e))?,
            Err(_) => parse_years(DEFAULT_YEARS)?,
        };

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            api: ApiConfig {
                base_url: std::env::var("CENSUS_API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
                api_key: std::env::var("CENSUS_API_KEY").ok().filter(|k| !k.is_empty()),
                acs1_page_url: std::env::var("CENSUS_ACS1_PAGE_URL")
                    .unwrap_or_else(|_| DEFAULT_ACS1_PAGE_URL.to_string()),
                acs5_page_url: std::env::var("CENSUS_ACS5_PAGE_URL")
                    .unwrap_or_else(|_| DEFAULT_ACS5_PAGE_URL.to_string()),
                http_timeout_secs: env_or("CENSUS_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
                cache_capacity: env_or("CENSUS_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY),
                cache_ttl_secs: env_or("CENSUS_CACHE_TTL_SECS", DEFAULT_CACHE_TTL.as_secs()),
            },
            network_concurrency: env_or("CENSUS_NETWORK_CONCURRENCY", DEFAULT_NETWORK_CONCURRENCY),
            storage_concurrency: env_or("CENSUS_STORAGE_CONCURRENCY", DEFAULT_STORAGE_CONCURRENCY),
            group_concurrency: env_or("CENSUS_GROUP_CONCURRENCY", DEFAULT_GROUP_CONCURRENCY),
            geography_concurrency: env_or(
                "CENSUS_GEOGRAPHY_CONCURRENCY",
                DEFAULT_GEOGRAPHY_CONCURRENCY,
            ),
            max_retries: env_or("CENSUS_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            initial_backoff_ms: env_or(
                "CENSUS_INITIAL_BACKOFF_MS",
                DEFAULT_INITIAL_BACKOFF.as_millis() as u64,
            ),
            call_timeout_secs: env_or("CENSUS_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT.as_secs()),
            vars_per_request: env_or("CENSUS_VARS_PER_REQUEST", MAX_VARIABLES_PER_REQUEST),
            window_multiplier: env_or("CENSUS_WINDOW_MULTIPLIER", DEFAULT_WINDOW_MULTIPLIER),
            storage_batch_size: env_or("CENSUS_STORAGE_BATCH_SIZE", DEFAULT_STORAGE_BATCH_SIZE),
            place_only: env_or("CENSUS_PLACE_ONLY", true),
            datasets: env_list("CENSUS_DATASETS").unwrap_or_else(|| split_list(DEFAULT_DATASETS)),
            years,
            allowed_groups: env_list("CENSUS_ALLOWED_GROUPS").filter(|g| !g.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("DATABASE_URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "DATABASE_MIN_CONNECTIONS ({}) cannot be greater than DATABASE_MAX_CONNECTIONS ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        for (name, size) in [
            ("CENSUS_NETWORK_CONCURRENCY", self.network_concurrency),
            ("CENSUS_STORAGE_CONCURRENCY", self.storage_concurrency),
            ("CENSUS_GROUP_CONCURRENCY", self.group_concurrency),
            ("CENSUS_GEOGRAPHY_CONCURRENCY", self.geography_concurrency),
            ("CENSUS_WINDOW_MULTIPLIER", self.window_multiplier),
            ("CENSUS_STORAGE_BATCH_SIZE", self.storage_batch_size),
        ] {
            if size == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if !(1..=MAX_VARIABLES_PER_REQUEST).contains(&self.vars_per_request) {
            anyhow::bail!(
                "CENSUS_VARS_PER_REQUEST must be between 1 and {}, got {}",
                MAX_VARIABLES_PER_REQUEST,
                self.vars_per_request
            );
        }

        if self.datasets.is_empty() {
            anyhow::bail!("CENSUS_DATASETS cannot be empty");
        }
        for id in &self.datasets {
            Dataset::from_id(id)?;
        }

        if self.years.is_empty() {
            tracing::warn!("No ingestion years configured");
        }

        Ok(())
    }

    pub fn datasets(&self) -> anyhow::Result<Vec<Dataset>> {
        Ok(self
            .datasets
            .iter()
            .map(|id| Dataset::from_id(id))
            .collect::<census_common::Result<Vec<_>>>()?)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.initial_backoff_ms))
    }

    pub fn client_config(&self) -> AcsClientConfig {
        AcsClientConfig {
            base_url: self.api.base_url.clone(),
            api_key: self.api.api_key.clone(),
            acs1_page_url: self.api.acs1_page_url.clone(),
            acs5_page_url: self.api.acs5_page_url.clone(),
            timeout: Duration::from_secs(self.api.http_timeout_secs),
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            network_concurrency: self.network_concurrency,
            storage_concurrency: self.storage_concurrency,
            group_concurrency: self.group_concurrency,
            geography_concurrency: self.geography_concurrency,
            retry: self.retry_policy(),
            call_timeout: self.call_timeout(),
            vars_per_request: self.vars_per_request,
            window_multiplier: self.window_multiplier,
            storage_batch_size: self.storage_batch_size,
            place_only: self.place_only,
            allowed_groups: self.allowed_groups.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "CENSUS_API_KEY",
        "CENSUS_NETWORK_CONCURRENCY",
        "CENSUS_VARS_PER_REQUEST",
        "CENSUS_DATASETS",
        "CENSUS_YEARS",
        "CENSUS_ALLOWED_GROUPS",
        "CENSUS_PLACE_ONLY",
        "CENSUS_CALL_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = IngestConfig::from_env().unwrap();

        assert_eq!(config.network_concurrency, 40);
        assert_eq!(config.storage_concurrency, 10);
        assert_eq!(config.vars_per_request, 50);
        assert_eq!(config.max_retries, 4);
        assert!(config.place_only);
        assert_eq!(config.datasets, vec!["acs5"]);
        assert_eq!(config.years, vec![2019, 2024]);
        assert!(config.allowed_groups.is_none());
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.ingest_options().window(), 80);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("CENSUS_DATASETS", "acs1, acs5");
        std::env::set_var("CENSUS_YEARS", "2015-2017,2019");
        std::env::set_var("CENSUS_ALLOWED_GROUPS", "B01001,B19013");
        std::env::set_var("CENSUS_PLACE_ONLY", "false");
        std::env::set_var("CENSUS_API_KEY", "secret");
        std::env::set_var("CENSUS_CALL_TIMEOUT_SECS", "0");

        let config = IngestConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.datasets().unwrap(), vec![Dataset::acs1(), Dataset::acs5()]);
        assert_eq!(config.years, vec![2015, 2016, 2017, 2019]);
        assert_eq!(
            config.allowed_groups,
            Some(vec!["B01001".to_string(), "B19013".to_string()])
        );
        assert!(!config.place_only);
        assert_eq!(config.client_config().api_key.as_deref(), Some("secret"));
        assert_eq!(config.call_timeout(), None);
    }

    #[test]
    #[serial]
    fn test_rejects_oversized_variable_batches() {
        clear_env();
        std::env::set_var("CENSUS_VARS_PER_REQUEST", "51");
        let err = IngestConfig::from_env().unwrap_err();
        clear_env();

        assert!(err.to_string().contains("CENSUS_VARS_PER_REQUEST"));
    }

    #[test]
    #[serial]
    fn test_rejects_zero_pool() {
        clear_env();
        std::env::set_var("CENSUS_NETWORK_CONCURRENCY", "0");
        let result = IngestConfig::from_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_parse_years_rejects_reversed_range() {
        assert!(parse_years("2020-2018").is_err());
        assert_eq!(parse_years(" 2019 ").unwrap(), vec![2019]);
    }
}
