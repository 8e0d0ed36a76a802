// 📈 Time-Series Merger - idempotent merge of fetched rows into per-entity storage
//
// Rows are keyed by date. Merging:
//   - date only in stored    -> kept as-is
//   - date only in incoming  -> added
//   - date in both           -> incoming non-null fields overwrite, the rest stay
// Output is sorted by date with one row per date. Applying the same batch
// twice leaves the same state as applying it once.
//
// Storage layout: <data_dir>/<code>/prices.csv and financials.csv, written
// via temp file + rename so a crash never leaves a half-written series.

use crate::entities::SecurityCode;
use crate::error::{MalformedInput, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DATE_COLUMN: &str = "Date";

// ============================================================================
// SERIES ROW
// ============================================================================

/// One dated observation. A field absent from `values` is null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRow {
    pub date: NaiveDate,
    pub values: BTreeMap<String, f64>,
}

impl SeriesRow {
    pub fn new(date: NaiveDate) -> Self {
        SeriesRow {
            date,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: f64) -> Self {
        self.set(field, Some(value));
        self
    }

    /// NaN and `None` are both treated as null and leave the field unset
    pub fn set(&mut self, field: &str, value: Option<f64>) {
        if let Some(v) = value.filter(|v| !v.is_nan()) {
            self.values.insert(field.to_string(), v);
        }
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }

    /// Overlay `other`'s non-null fields onto this row
    fn absorb(&mut self, other: &SeriesRow) {
        for (field, value) in &other.values {
            self.values.insert(field.clone(), *value);
        }
    }
}

/// Which per-entity table a batch of rows belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesKind {
    /// Daily OHLCV
    Prices,
    /// Quarterly statement items
    Financials,
}

impl SeriesKind {
    pub fn file_name(self) -> &'static str {
        match self {
            SeriesKind::Prices => "prices.csv",
            SeriesKind::Financials => "financials.csv",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Dates that did not exist before
    pub inserted: usize,
    /// Existing dates whose values changed
    pub updated: usize,
    /// Rows stored after the merge
    pub total: usize,
}

// ============================================================================
// MERGE
// ============================================================================

/// Merge `incoming` into `existing`. Pure; see module docs for the rules.
pub fn merge_rows(existing: &[SeriesRow], incoming: &[SeriesRow]) -> Vec<SeriesRow> {
    merge_with_outcome(existing, incoming).0
}

fn merge_with_outcome(existing: &[SeriesRow], incoming: &[SeriesRow]) -> (Vec<SeriesRow>, MergeOutcome) {
    let mut by_date: BTreeMap<NaiveDate, SeriesRow> = BTreeMap::new();
    for row in existing {
        by_date
            .entry(row.date)
            .and_modify(|stored| stored.absorb(row))
            .or_insert_with(|| row.clone());
    }

    let mut outcome = MergeOutcome::default();
    let mut touched: BTreeSet<NaiveDate> = BTreeSet::new();

    for row in incoming {
        match by_date.get_mut(&row.date) {
            Some(stored) => {
                let before = stored.clone();
                stored.absorb(row);
                if *stored != before && touched.insert(row.date) {
                    outcome.updated += 1;
                }
            }
            None => {
                by_date.insert(row.date, row.clone());
                touched.insert(row.date);
                outcome.inserted += 1;
            }
        }
    }

    let merged: Vec<SeriesRow> = by_date.into_values().collect();
    outcome.total = merged.len();
    (merged, outcome)
}

// ============================================================================
// PER-ENTITY STORAGE
// ============================================================================

/// CSV-backed per-entity series storage rooted at the data directory
#[derive(Debug, Clone)]
pub struct SeriesStore {
    root: PathBuf,
}

impl SeriesStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SeriesStore { root: root.into() }
    }

    pub fn entity_dir(&self, code: &SecurityCode) -> PathBuf {
        self.root.join(code.as_str())
    }

    pub fn path(&self, code: &SecurityCode, kind: SeriesKind) -> PathBuf {
        self.entity_dir(code).join(kind.file_name())
    }

    pub fn ensure_entity_dir(&self, code: &SecurityCode) -> Result<PathBuf> {
        let dir = self.entity_dir(code);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Stored rows, sorted by date. A missing file is an empty series.
    pub fn load(&self, code: &SecurityCode, kind: SeriesKind) -> Result<Vec<SeriesRow>> {
        let path = self.path(code, kind);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_series(&path)
    }

    pub fn last_date(&self, code: &SecurityCode, kind: SeriesKind) -> Result<Option<NaiveDate>> {
        Ok(self.load(code, kind)?.last().map(|row| row.date))
    }

    /// Merge `incoming` into the stored series and write it back atomically
    pub fn merge(&self, code: &SecurityCode, kind: SeriesKind, incoming: &[SeriesRow]) -> Result<MergeOutcome> {
        let existing = self.load(code, kind)?;
        let (merged, outcome) = merge_with_outcome(&existing, incoming);

        if outcome.inserted == 0 && outcome.updated == 0 && self.path(code, kind).exists() {
            debug!(code = %code, ?kind, "merge produced no changes");
            return Ok(outcome);
        }

        self.ensure_entity_dir(code)?;
        write_series(&self.path(code, kind), &merged)?;
        debug!(code = %code, ?kind, inserted = outcome.inserted, updated = outcome.updated, "series merged");

        Ok(outcome)
    }
}

/// Accepts `2024-04-01`, `2024-04-01 00:00:00+09:00`, `2024-04-01T00:00:00`
pub fn parse_series_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .map_err(|_| MalformedInput::InvalidDate(raw.to_string()).into())
}

fn parse_value(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Read a series CSV (header `Date,<fields...>`)
pub fn read_series(path: &Path) -> Result<Vec<SeriesRow>> {
    let file = fs::File::open(path)?;
    read_series_from(file)
}

pub fn read_series_from<R: std::io::Read>(reader: R) -> Result<Vec<SeriesRow>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let date_idx = headers
        .iter()
        .position(|h| h.trim().trim_start_matches('\u{FEFF}').eq_ignore_ascii_case(DATE_COLUMN))
        .ok_or_else(|| MalformedInput::MissingColumns(vec![DATE_COLUMN.to_string()]))?;

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let mut row = SeriesRow::new(parse_series_date(record.get(date_idx).unwrap_or(""))?);

        for (idx, header) in headers.iter().enumerate() {
            if idx == date_idx {
                continue;
            }
            row.set(header.trim(), record.get(idx).and_then(parse_value));
        }
        rows.push(row);
    }

    // Stored files are already ordered; dedupe defensively for hand-edited ones
    Ok(merge_rows(&[], &rows))
}

fn write_series(path: &Path, rows: &[SeriesRow]) -> Result<()> {
    let fields: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.values.keys().map(String::as_str))
        .collect();

    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut wtr = WriterBuilder::new().from_path(&tmp_path)?;

        let mut header = vec![DATE_COLUMN];
        header.extend(fields.iter().copied());
        wtr.write_record(&header)?;

        for row in rows {
            let mut record = vec![row.date.format("%Y-%m-%d").to_string()];
            record.extend(
                fields
                    .iter()
                    .map(|f| row.get(f).map(|v| v.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}
