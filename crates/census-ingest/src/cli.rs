//! Command-line interface

use census_common::types::Frequency;
use clap::{Args, Parser, Subcommand};

/// Census ACS ingestion and lookup
#[derive(Parser, Debug)]
#[command(name = "census-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Census API key
    #[arg(long, env = "CENSUS_API_KEY", global = true, hide_env_values = true)]
    pub api_key: Option<String>,
}

/// A dataset id and a year
#[derive(Args, Debug, Clone)]
pub struct DatasetYear {
    /// Dataset id (e.g. acs1, acs5)
    #[arg(short, long, default_value = "acs5")]
    pub dataset: String,

    /// Survey year
    #[arg(short, long)]
    pub year: i32,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest every configured (dataset, year), resuming from checkpoints
    Ingest {
        /// Dataset ids, overriding CENSUS_DATASETS
        #[arg(short, long, value_delimiter = ',')]
        dataset: Vec<String>,

        /// Years or ranges (2019,2021-2023), overriding CENSUS_YEARS
        #[arg(short, long, value_delimiter = ',')]
        year: Vec<String>,

        /// Only ingest these groups, overriding CENSUS_ALLOWED_GROUPS
        #[arg(short, long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Also request estimates per county
        #[arg(long)]
        include_counties: bool,

        /// Write to an in-memory store instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },

    /// Register a dataset
    CreateDataset {
        /// Product code
        #[arg(short, long, default_value = "acs")]
        code: String,

        /// Release cadence (annual or quinquennial)
        #[arg(short, long)]
        frequency: Frequency,
    },

    /// Show the ingestion checkpoint of a (dataset, year)
    Checkpoint {
        #[command(flatten)]
        target: DatasetYear,
    },

    /// List years of a dataset
    Years {
        /// Dataset id
        #[arg(short, long, default_value = "acs5")]
        dataset: String,
    },

    /// List groups
    Groups {
        #[command(flatten)]
        target: DatasetYear,
    },

    /// List the variables of a group
    Variables {
        #[command(flatten)]
        target: DatasetYear,

        /// Group id (e.g. B01001)
        #[arg(short, long)]
        group: String,
    },

    /// List states
    States {
        #[command(flatten)]
        target: DatasetYear,

        /// Exact state name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List the counties of a state
    Counties {
        #[command(flatten)]
        target: DatasetYear,

        /// State FIPS code, zero-padded if shorter (`1` is `01`)
        #[arg(short, long)]
        state: String,

        /// Exact county name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List the places of a state
    Places {
        #[command(flatten)]
        target: DatasetYear,

        /// State FIPS code, zero-padded if shorter (`1` is `01`)
        #[arg(short, long)]
        state: String,

        /// Exact place name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show estimates for one geography
    Estimates {
        #[command(flatten)]
        target: DatasetYear,

        /// Variable ids, at most 50
        #[arg(long, value_delimiter = ',', required = true)]
        variables: Vec<String>,

        /// State FIPS code, zero-padded if shorter (`1` is `01`)
        #[arg(short, long)]
        state: String,

        /// County FIPS code
        #[arg(long, conflicts_with = "place")]
        county: Option<String>,

        /// Place FIPS code
        #[arg(short, long)]
        place: Option<String>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ingest_lists_split_on_commas() {
        let cli = Cli::try_parse_from([
            "census-ingest",
            "ingest",
            "--dataset",
            "acs1,acs5",
            "--year",
            "2019,2021-2022",
            "--groups",
            "B01001",
            "--dry-run",
        ])
        .unwrap();

        match cli.command {
            Commands::Ingest {
                dataset,
                year,
                groups,
                include_counties,
                dry_run,
            } => {
                assert_eq!(dataset, vec!["acs1", "acs5"]);
                assert_eq!(year, vec!["2019", "2021-2022"]);
                assert_eq!(groups, vec!["B01001"]);
                assert!(!include_counties);
                assert!(dry_run);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_estimates_reject_county_and_place_together() {
        let result = Cli::try_parse_from([
            "census-ingest",
            "estimates",
            "--year",
            "2019",
            "--variables",
            "B01001_001E",
            "--state",
            "01",
            "--county",
            "001",
            "--place",
            "07000",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_dataset_parses_frequency() {
        let cli = Cli::try_parse_from([
            "census-ingest",
            "create-dataset",
            "--frequency",
            "annual",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::CreateDataset {
                frequency: Frequency::Annual,
                ..
            }
        ));
    }
}
