//! Census ACS ingestion and lookup
//!
//! Pulls the American Community Survey catalog (groups and variables), the
//! geography (states, counties, places) and the estimates from the Census
//! Bureau API into Postgres, resumably, one (dataset, year) at a time.
//!
//! # Example
//!
//! ```no_run
//! use census_common::types::Dataset;
//! use census_ingest::client::{AcsClient, AcsClientConfig};
//! use census_ingest::orchestrator::{IngestOptions, IngestOrchestrator};
//! use census_ingest::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = MemoryStore::new();
//!     let orchestrator = IngestOrchestrator::new(
//!         Arc::new(AcsClient::new(AcsClientConfig::default())?),
//!         Arc::new(store.clone()),
//!         Arc::new(store),
//!         IngestOptions::default(),
//!     );
//!     orchestrator.run(&Dataset::acs5(), 2019).await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod estimates;
pub mod executor;
pub mod loaders;
pub mod lookup;
pub mod orchestrator;
pub mod retry;
pub mod storage;

pub use cli::Cli;
pub use config::IngestConfig;
pub use lookup::CensusLookup;
pub use orchestrator::{IngestOptions, IngestOrchestrator, IngestReport};
