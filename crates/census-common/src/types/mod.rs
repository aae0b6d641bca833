//! Domain types shared by the ingestion pipeline, storage and lookups

use crate::error::{CensusError, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Datasets and years
// ============================================================================

/// Release cadence of a survey product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// ACS 1-year estimates
    Annual,
    /// ACS 5-year estimates
    Quinquennial,
}

impl Frequency {
    /// Number of survey years folded into one release (the `acs{n}` path segment)
    pub fn span_years(self) -> u8 {
        match self {
            Frequency::Annual => 1,
            Frequency::Quinquennial => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Annual => "annual",
            Frequency::Quinquennial => "quinquennial",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = CensusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "annual" | "1" | "acs1" => Ok(Frequency::Annual),
            "quinquennial" | "5" | "acs5" => Ok(Frequency::Quinquennial),
            other => Err(CensusError::Config(format!("Unknown dataset frequency: {}", other))),
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A survey product such as ACS 5-year.
///
/// The id is derived from code and cadence (`acs` + 5 -> `acs5`), so creating
/// the same product twice yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub code: String,
    pub frequency: Frequency,
}

impl Dataset {
    pub fn new(code: impl Into<String>, frequency: Frequency) -> Self {
        let code = code.into();
        Self {
            id: format!("{}{}", code, frequency.span_years()),
            code,
            frequency,
        }
    }

    pub fn acs1() -> Self {
        Self::new("acs", Frequency::Annual)
    }

    pub fn acs5() -> Self {
        Self::new("acs", Frequency::Quinquennial)
    }

    /// Resolve a dataset id like `acs5` back to the product it names
    pub fn from_id(id: &str) -> Result<Self> {
        let split = id
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| CensusError::Config(format!("Dataset id has no frequency: {}", id)))?;
        let (code, span) = id.split_at(split);
        if code.is_empty() {
            return Err(CensusError::Config(format!("Dataset id has no code: {}", id)));
        }
        Ok(Self::new(code, span.parse()?))
    }
}

/// A year registered for a dataset; `id` is the storage surrogate key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableYear {
    pub id: i64,
    pub dataset_id: String,
    pub year: i32,
}

// ============================================================================
// Groups and variables
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub description: String,
    pub variable_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    pub description: String,
}

/// A variable together with the group it belongs to, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub group_id: String,
    pub variable: Variable,
}

// ============================================================================
// Geography
// ============================================================================

/// One state, county or place as returned upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeographyUnit {
    pub name: String,
    pub fips: String,
    /// State FIPS for counties and places, `None` for states
    pub parent_fips: Option<String>,
}

/// A state with its own counties and places
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWithChildren {
    pub fips: String,
    pub name: String,
    pub counties: Vec<GeographyUnit>,
    pub places: Vec<GeographyUnit>,
}

pub const STATE_FIPS_WIDTH: usize = 2;
pub const COUNTY_FIPS_WIDTH: usize = 3;
pub const PLACE_FIPS_WIDTH: usize = 5;

/// Left-pad a numeric FIPS code with zeros to `width` digits.
///
/// Codes that are not all digits, or already `width` long, are returned
/// trimmed but otherwise unchanged.
pub fn pad_fips(code: &str, width: usize) -> String {
    let code = code.trim();
    if !code.is_empty() && code.len() < width && code.bytes().all(|b| b.is_ascii_digit()) {
        format!("{:0>width$}", code, width = width)
    } else {
        code.to_string()
    }
}

/// Granularity of one estimate request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeographyScope {
    State,
    County,
    Place,
}

impl GeographyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            GeographyScope::State => "state",
            GeographyScope::County => "county",
            GeographyScope::Place => "place",
        }
    }
}

/// Geography an estimate request is filtered to.
///
/// `state_fips` is always present. At most one of `county_fips` and
/// `place_fips` may be set; see [`GeographyFilter::scope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeographyFilter {
    pub state_fips: String,
    pub county_fips: Option<String>,
    pub place_fips: Option<String>,
}

impl GeographyFilter {
    pub fn state(state_fips: impl AsRef<str>) -> Self {
        Self {
            state_fips: pad_fips(state_fips.as_ref(), STATE_FIPS_WIDTH),
            county_fips: None,
            place_fips: None,
        }
    }

    pub fn county(state_fips: impl AsRef<str>, county_fips: impl AsRef<str>) -> Self {
        Self {
            county_fips: Some(pad_fips(county_fips.as_ref(), COUNTY_FIPS_WIDTH)),
            ..Self::state(state_fips)
        }
    }

    pub fn place(state_fips: impl AsRef<str>, place_fips: impl AsRef<str>) -> Self {
        Self {
            place_fips: Some(pad_fips(place_fips.as_ref(), PLACE_FIPS_WIDTH)),
            ..Self::state(state_fips)
        }
    }

    /// The same filter with every code zero-padded to its canonical width
    pub fn normalized(&self) -> Self {
        Self {
            state_fips: pad_fips(&self.state_fips, STATE_FIPS_WIDTH),
            county_fips: self
                .county_fips
                .as_deref()
                .map(|c| pad_fips(c, COUNTY_FIPS_WIDTH)),
            place_fips: self
                .place_fips
                .as_deref()
                .map(|p| pad_fips(p, PLACE_FIPS_WIDTH)),
        }
    }

    /// The single level this filter addresses
    pub fn scope(&self) -> Result<GeographyScope> {
        if self.state_fips.is_empty() {
            return Err(CensusError::InvalidGeographyScope(
                "state FIPS is required".to_string(),
            ));
        }
        match (&self.county_fips, &self.place_fips) {
            (Some(county), Some(place)) => Err(CensusError::InvalidGeographyScope(format!(
                "county {} and place {} both set for state {}",
                county, place, self.state_fips
            ))),
            (Some(_), None) => Ok(GeographyScope::County),
            (None, Some(_)) => Ok(GeographyScope::Place),
            (None, None) => Ok(GeographyScope::State),
        }
    }
}

impl std::fmt::Display for GeographyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state={}", self.state_fips)?;
        if let Some(ref county) = self.county_fips {
            write!(f, " county={}", county)?;
        }
        if let Some(ref place) = self.place_fips {
            write!(f, " place={}", place)?;
        }
        Ok(())
    }
}

// ============================================================================
// Estimates
// ============================================================================

/// One raw cell of an estimate response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateValue {
    pub variable_id: String,
    /// Upstream text, `None` when the API returned null
    pub raw_value: Option<String>,
}

/// One matched geographic unit, values in request order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateRow {
    pub state_fips: String,
    pub county_fips: Option<String>,
    pub place_fips: Option<String>,
    pub values: Vec<EstimateValue>,
}

/// A stored estimate, keyed by variable, geography, dataset and year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub variable_id: String,
    pub group_id: String,
    pub state_fips: String,
    pub county_fips: Option<String>,
    pub place_fips: Option<String>,
    pub dataset_id: String,
    pub year_id: i64,
    pub value: Option<f64>,
    pub margin_of_error: Option<f64>,
}

/// Group id of an ACS variable: the prefix before the first `_`
pub fn group_of(variable_id: &str) -> &str {
    variable_id
        .split_once('_')
        .map(|(group, _)| group)
        .unwrap_or(variable_id)
}

/// Estimate id a margin-of-error id belongs to: `B01001_001M` -> `B01001_001E`
pub fn margin_sibling(variable_id: &str) -> Option<String> {
    variable_id
        .strip_suffix('M')
        .filter(|stem| stem.contains('_'))
        .map(|stem| format!("{}E", stem))
}

fn parse_value(raw: &Option<String>) -> Option<f64> {
    raw.as_deref().and_then(|v| v.trim().parse::<f64>().ok())
}

impl EstimateRow {
    /// Convert to storage records.
    ///
    /// A margin-of-error variable (`..._001M`) requested alongside its estimate
    /// (`..._001E`) is folded into that record. Anything else becomes a record
    /// of its own. The geography comes from the job that issued the request,
    /// not from the response columns.
    pub fn into_records(
        self,
        geography: &GeographyFilter,
        dataset_id: &str,
        year_id: i64,
    ) -> Vec<EstimateRecord> {
        let requested: std::collections::HashSet<&str> =
            self.values.iter().map(|v| v.variable_id.as_str()).collect();

        let mut margins = std::collections::HashMap::new();
        for value in &self.values {
            if let Some(sibling) = margin_sibling(&value.variable_id) {
                if requested.contains(sibling.as_str()) {
                    margins.insert(sibling, parse_value(&value.raw_value));
                }
            }
        }

        self.values
            .iter()
            .filter(|v| {
                margin_sibling(&v.variable_id).map_or(true, |s| !requested.contains(s.as_str()))
            })
            .map(|v| EstimateRecord {
                group_id: group_of(&v.variable_id).to_string(),
                state_fips: geography.state_fips.clone(),
                county_fips: geography.county_fips.clone(),
                place_fips: geography.place_fips.clone(),
                dataset_id: dataset_id.to_string(),
                year_id,
                value: parse_value(&v.raw_value),
                margin_of_error: margins.get(&v.variable_id).copied().flatten(),
                variable_id: v.variable_id.clone(),
            })
            .collect()
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// One resumable ingestion stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Groups,
    Variables,
    Geography,
    Estimates,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Groups,
        Stage::Variables,
        Stage::Geography,
        Stage::Estimates,
    ];

    /// Persisted flag name
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Groups => "groups_ingested",
            Stage::Variables => "variables_ingested",
            Stage::Geography => "geography_ingested",
            Stage::Estimates => "estimates_ingested",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = CensusError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| CensusError::InvalidStageName(s.to_string()))
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress record for one (dataset, year). Flags only ever go false -> true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCheckpoint {
    pub dataset_id: String,
    pub year: i32,
    pub groups_ingested: bool,
    pub variables_ingested: bool,
    pub geography_ingested: bool,
    pub estimates_ingested: bool,
}

impl IngestionCheckpoint {
    pub fn new(dataset_id: impl Into<String>, year: i32) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            year,
            groups_ingested: false,
            variables_ingested: false,
            geography_ingested: false,
            estimates_ingested: false,
        }
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        match stage {
            Stage::Groups => self.groups_ingested,
            Stage::Variables => self.variables_ingested,
            Stage::Geography => self.geography_ingested,
            Stage::Estimates => self.estimates_ingested,
        }
    }

    pub fn mark(&mut self, stage: Stage) {
        match stage {
            Stage::Groups => self.groups_ingested = true,
            Stage::Variables => self.variables_ingested = true,
            Stage::Geography => self.geography_ingested = true,
            Stage::Estimates => self.estimates_ingested = true,
        }
    }

    pub fn is_complete(&self) -> bool {
        Stage::ALL.into_iter().all(|stage| self.is_done(stage))
    }
}
