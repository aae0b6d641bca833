//! Census Common Library
//!
//! Shared types, logging, and error handling for the census ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CensusError`] and the crate-wide [`Result`] alias
//! - **Logging**: `tracing` subscriber bootstrap driven by [`logging::LogConfig`]
//! - **Types**: datasets, groups, variables, geography, estimates and checkpoints
//!
//! # Example
//!
//! ```no_run
//! use census_common::{CensusError, Result};
//! use census_common::types::Stage;
//!
//! fn parse_stage(name: &str) -> Result<Stage> {
//!     name.parse()
//! }
//!
//! assert!(matches!(parse_stage("bogus"), Err(CensusError::InvalidStageName(_))));
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CensusError, Result};
