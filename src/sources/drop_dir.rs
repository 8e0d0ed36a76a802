// File-backed sources: an upstream fetcher drops raw files into an inbox
// directory, one folder per security:
//
//   <inbox>/7203.T/prices.csv         Date,Open,High,Low,Close,Volume
//   <inbox>/7203.T/financials.csv     Date,<statement items...>
//   <inbox>/7203.T/splits.csv         Date,Ratio
//   <inbox>/7203.T/qualitative.json   QualitativeReport

use super::{MarketDataSource, QualitativeReport, QualitativeSource};
use crate::entities::SecurityCode;
use crate::error::SourceError;
use crate::timeseries::{parse_series_date, read_series, SeriesRow};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

fn unavailable(path: &Path, err: impl std::fmt::Display) -> SourceError {
    SourceError::Unavailable(format!("{}: {}", path.display(), err))
}

#[derive(Debug, Clone)]
pub struct DropDirSource {
    root: PathBuf,
}

impl DropDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DropDirSource { root: root.into() }
    }

    fn file(&self, code: &SecurityCode, name: &str) -> PathBuf {
        self.root.join(code.as_str()).join(name)
    }
}

impl MarketDataSource for DropDirSource {
    fn fetch_prices(
        &self,
        code: &SecurityCode,
        since: Option<NaiveDate>,
    ) -> Result<Vec<SeriesRow>, SourceError> {
        let path = self.file(code, "prices.csv");
        if !path.exists() {
            return Err(unavailable(&path, "no price drop"));
        }

        let rows = read_series(&path).map_err(|e| unavailable(&path, e))?;
        Ok(match since {
            Some(start) => rows.into_iter().filter(|r| r.date >= start).collect(),
            None => rows,
        })
    }

    fn fetch_financials(&self, code: &SecurityCode) -> Result<Vec<SeriesRow>, SourceError> {
        let path = self.file(code, "financials.csv");
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_series(&path).map_err(|e| unavailable(&path, e))
    }

    fn fetch_split_dates(&self, code: &SecurityCode) -> Result<Vec<NaiveDate>, SourceError> {
        let path = self.file(code, "splits.csv");
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut rdr = csv::Reader::from_path(&path).map_err(|e| unavailable(&path, e))?;
        let mut dates = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| unavailable(&path, e))?;
            let date = parse_series_date(record.get(0).unwrap_or(""))
                .map_err(|e| unavailable(&path, e))?;
            dates.push(date);
        }
        Ok(dates)
    }

    fn name(&self) -> &str {
        "drop-dir"
    }
}

#[derive(Debug, Clone)]
pub struct DropDirQualitativeSource {
    root: PathBuf,
}

impl DropDirQualitativeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DropDirQualitativeSource { root: root.into() }
    }
}

impl QualitativeSource for DropDirQualitativeSource {
    fn fetch(
        &self,
        code: &SecurityCode,
        _target_date: NaiveDate,
    ) -> Result<Option<QualitativeReport>, SourceError> {
        let path = self.root.join(code.as_str()).join("qualitative.json");
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| unavailable(&path, e))?;
        let report: QualitativeReport =
            serde_json::from_str(&raw).map_err(|e| unavailable(&path, e))?;
        Ok(Some(report))
    }
}
