// External data sources
//
// The HTTP/API clients live outside this crate. The harvester only sees these
// traits, so any client (or a test double) can be plugged in:
//
// - MarketDataSource:   dated price rows, quarterly financials, split dates
// - QualitativeSource:  free-text sections from the annual securities report

pub mod drop_dir;

pub use drop_dir::{DropDirQualitativeSource, DropDirSource};

use crate::entities::SecurityCode;
use crate::error::SourceError;
use crate::timeseries::SeriesRow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Per-entity market data, rate limited by the provider
pub trait MarketDataSource {
    /// Daily rows on or after `since`; full history when `since` is `None`
    fn fetch_prices(
        &self,
        code: &SecurityCode,
        since: Option<NaiveDate>,
    ) -> Result<Vec<SeriesRow>, SourceError>;

    /// Quarterly financial statement rows, one per period end
    fn fetch_financials(&self, code: &SecurityCode) -> Result<Vec<SeriesRow>, SourceError>;

    /// Dates of stock splits / consolidations. Sources that cannot report
    /// corporate actions return an empty list.
    fn fetch_split_dates(&self, _code: &SecurityCode) -> Result<Vec<NaiveDate>, SourceError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "market-data"
    }
}

/// Free-text sections of the latest annual report for one security
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitativeReport {
    /// Fiscal year end the report covers (YYYY-MM-DD)
    pub fiscal_year_end: String,
    #[serde(default)]
    pub business_description: Option<String>,
    #[serde(default)]
    pub history: Option<String>,
    #[serde(default)]
    pub dividend_policy: Option<String>,
    #[serde(default)]
    pub shareholder_benefits: Option<String>,
}

impl QualitativeReport {
    pub fn is_empty(&self) -> bool {
        self.business_description.is_none()
            && self.history.is_none()
            && self.dividend_policy.is_none()
            && self.shareholder_benefits.is_none()
    }
}

pub trait QualitativeSource {
    /// Report filed around `target_date`; `Ok(None)` when nothing was filed
    fn fetch(
        &self,
        code: &SecurityCode,
        target_date: NaiveDate,
    ) -> Result<Option<QualitativeReport>, SourceError>;
}
