//! Error types for census ingestion

use thiserror::Error;

/// Result type alias for census operations
pub type Result<T> = std::result::Result<T, CensusError>;

/// Main error type for census ingestion
///
/// Upstream failures (`SourceUnavailable`, `SourceApi`, `Timeout`) are retried by
/// the backoff wrapper. Parse and lookup failures are surfaced immediately, and
/// contract violations (`InvalidGeographyScope`, `InvalidStageName`) indicate a
/// caller bug.
#[derive(Error, Debug)]
pub enum CensusError {
    /// The upstream page or endpoint could not be reached or answered non-2xx
    #[error("Source unavailable ({url}): {message}")]
    SourceUnavailable {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// The statistical API answered with an error status or an unusable body
    #[error("Census API error ({url}, status {status:?}): {message}")]
    SourceApi {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Source parse error: {0}")]
    SourceParse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An estimate request named more than one geography level, or none
    #[error("Invalid geography scope: {0}")]
    InvalidGeographyScope(String),

    #[error("Invalid checkpoint stage name: {0}")]
    InvalidStageName(String),

    /// An estimate request asked for no variables or more than one call allows
    #[error("Invalid variable batch: {requested} variables requested, limit is {limit}")]
    InvalidVariableBatch { requested: usize, limit: usize },

    #[error("Timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    /// The retry budget ran out; `source` is the last underlying error
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<CensusError>,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CensusError {
    /// Wrap any storage-layer error
    pub fn database(err: impl std::fmt::Display) -> Self {
        CensusError::Database(err.to_string())
    }

    /// Whether the retry wrapper should try the call again.
    ///
    /// HTTP failures are retried regardless of status code; status-aware
    /// classification is a known follow-up, not done here.
    pub fn is_retryable(&self) -> bool {
        match self {
            CensusError::SourceUnavailable { .. }
            | CensusError::SourceApi { .. }
            | CensusError::Timeout { .. }
            | CensusError::Database(_)
            | CensusError::Io(_) => true,
            CensusError::RetriesExhausted { .. }
            | CensusError::SourceParse(_)
            | CensusError::NotFound(_)
            | CensusError::InvalidGeographyScope(_)
            | CensusError::InvalidStageName(_)
            | CensusError::InvalidVariableBatch { .. }
            | CensusError::Config(_)
            | CensusError::Internal(_)
            | CensusError::Serialization(_) => false,
        }
    }

    /// The underlying error, looking through retry exhaustion
    pub fn root_cause(&self) -> &CensusError {
        match self {
            CensusError::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Number of attempts recorded by the retry wrapper (1 if it never retried)
    pub fn attempts(&self) -> u32 {
        match self {
            CensusError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// HTTP status attached to an upstream failure, if any
    pub fn status(&self) -> Option<u16> {
        match self.root_cause() {
            CensusError::SourceUnavailable { status, .. } | CensusError::SourceApi { status, .. } => {
                *status
            },
            _ => None,
        }
    }
}
