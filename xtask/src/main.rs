//! Build automation tasks
//!
//! - `generate-cli-docs`: render the `census-ingest` command reference to markdown

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for census-ingest", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<census_ingest::Cli>();

    let content = format!(
        r#"# census-ingest CLI Reference

Generated from the CLI definitions on {}.

## Quick Start

```bash
# Register the 5-year product
census-ingest create-dataset --code acs --frequency quinquennial

# Ingest two years, places only
census-ingest ingest --dataset acs5 --year 2019,2021

# Inspect progress
census-ingest checkpoint --dataset acs5 --year 2019

# Read back (falls through to the live API on a miss)
census-ingest places --dataset acs5 --year 2019 --state 01
census-ingest estimates --dataset acs5 --year 2019 --state 01 --place 07000 \
  --variables B01001_001E,B01001_001M
```

## Environment Variables

- `DATABASE_URL` - Postgres connection string
- `CENSUS_API_KEY` - Census API key, sent as the `key` query parameter
- `CENSUS_DATASETS`, `CENSUS_YEARS`, `CENSUS_ALLOWED_GROUPS` - what to ingest
- `CENSUS_NETWORK_CONCURRENCY`, `CENSUS_STORAGE_CONCURRENCY` - pool sizes
- `CENSUS_MAX_RETRIES`, `CENSUS_INITIAL_BACKOFF_MS`, `CENSUS_CALL_TIMEOUT_SECS` - retry and timeout
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR` - logging

## Commands

{}

---

*Regenerate with `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());
    Ok(())
}
