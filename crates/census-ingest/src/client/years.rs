//! Year range discovery from the ACS announcement pages
//!
//! The pages carry a heading such as
//! `American Community Survey 5-Year Data (2009-2023)`.

use census_common::{CensusError, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

/// Extract the inclusive year range from the first `h1` carrying `(start-end)`
pub fn parse_year_range(html: &str) -> Result<Vec<i32>> {
    let document = Html::parse_document(html);
    let headings = Selector::parse("h1")
        .map_err(|e| CensusError::Internal(format!("Invalid heading selector: {}", e)))?;
    let pattern = Regex::new(r"\((\d{4})\s*-\s*(\d{4})\)")
        .map_err(|e| CensusError::Internal(format!("Invalid year pattern: {}", e)))?;

    for heading in document.select(&headings) {
        let text: String = heading.text().collect();
        for captures in pattern.captures_iter(&text) {
            let start: i32 = captures[1].parse().map_err(|_| {
                CensusError::SourceParse(format!("Bad start year in heading '{}'", text.trim()))
            })?;
            let end: i32 = captures[2].parse().map_err(|_| {
                CensusError::SourceParse(format!("Bad end year in heading '{}'", text.trim()))
            })?;
            if start <= end {
                return Ok((start..=end).collect());
            }
            debug!(heading = %text.trim(), "Skipping inverted year range");
        }
    }

    Err(CensusError::SourceParse(
        "No heading with a (start-end) year range".to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_heading_range() {
        let html = r#"<html><body>
            <h1>Census Data API</h1>
            <h1>American Community Survey 5-Year Data (2009-2013)</h1>
        </body></html>"#;

        assert_eq!(parse_year_range(html).unwrap(), vec![2009, 2010, 2011, 2012, 2013]);
    }

    #[test]
    fn test_ignores_non_heading_text() {
        let html = "<p>(2005-2023)</p><h1>ACS 1-Year (2022 - 2023)</h1>";
        assert_eq!(parse_year_range(html).unwrap(), vec![2022, 2023]);
    }

    #[test]
    fn test_missing_range_is_parse_error() {
        let html = "<h1>American Community Survey (ACS)</h1><p>(2009-2023)</p>";
        assert!(matches!(parse_year_range(html), Err(CensusError::SourceParse(_))));
    }
}
