// 📝 Qualitative Info - per-security info.json built from annual reports
//
// Two kinds of fields:
//   - overwritten:  business_description, history_summary (latest report wins)
//   - history:      dividend_policy_history, benefits_history, newest first,
//                   one entry per fiscal year end (a re-filed report for the
//                   same year replaces that year's text in place)

use crate::entities::SecurityCode;
use crate::error::{MalformedInput, Result};
use crate::normalize::normalize;
use crate::sources::QualitativeReport;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const INFO_FILE: &str = "info.json";

/// Section openers inside the share-procedures text block
const BENEFIT_KEYWORDS: &[&str] = &["株主に対する特典", "株主優待", "株主特典", "優待制度", "特典の概要"];

/// Whatever follows the benefits section in that block
const BENEFIT_END_KEYWORDS: &[&str] = &["（注）", "単元未満株式", "公告掲載方法", "第７"];

/// An end keyword must start at least this many characters after the opener
const MIN_SECTION_CHARS: usize = 10;

/// Wide enough that report paragraphs never wrap
const RENDER_WIDTH: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fiscal_year_end: String,
    pub report_date: NaiveDate,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoDocument {
    pub ticker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_summary: Option<String>,
    #[serde(default)]
    pub dividend_policy_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub benefits_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub last_updated: Option<NaiveDate>,
}

impl InfoDocument {
    pub fn new(code: &SecurityCode) -> Self {
        InfoDocument {
            ticker: code.to_string(),
            business_description: None,
            history_summary: None,
            dividend_policy_history: Vec::new(),
            benefits_history: Vec::new(),
            last_updated: None,
        }
    }

    /// Fold one report into the document. Text is cleaned of markup and
    /// normalized before storing.
    pub fn apply_report(&mut self, report: &QualitativeReport, today: NaiveDate) {
        if let Some(text) = cleaned(report.business_description.as_deref()) {
            self.business_description = Some(text);
        }
        if let Some(text) = cleaned(report.history.as_deref()) {
            self.history_summary = Some(text);
        }
        if let Some(text) = cleaned(report.dividend_policy.as_deref()) {
            upsert_history(&mut self.dividend_policy_history, &report.fiscal_year_end, text, today);
        }
        // Section markers are full-width, so cut before normalizing
        let benefits = report.shareholder_benefits.as_deref().map(|raw| {
            let plain = strip_markup(raw);
            extract_benefits_section(&plain).unwrap_or(&plain).to_string()
        });
        if let Some(text) = cleaned(benefits.as_deref()) {
            upsert_history(&mut self.benefits_history, &report.fiscal_year_end, text, today);
        }
        self.last_updated = Some(today);
    }
}

fn cleaned(raw: Option<&str>) -> Option<String> {
    raw.map(strip_markup)
        .map(|text| normalize(&text))
        .filter(|text| !text.is_empty())
}

fn upsert_history(history: &mut Vec<HistoryEntry>, fiscal_year_end: &str, text: String, today: NaiveDate) {
    match history.iter_mut().find(|e| e.fiscal_year_end == fiscal_year_end) {
        Some(entry) => {
            entry.text = text;
            entry.report_date = today;
        }
        None => history.push(HistoryEntry {
            fiscal_year_end: fiscal_year_end.to_string(),
            report_date: today,
            text,
        }),
    }
    // ISO dates sort lexically
    history.sort_by(|a, b| b.fiscal_year_end.cmp(&a.fiscal_year_end));
}

// ============================================================================
// TEXT EXTRACTION
// ============================================================================

/// Render an HTML text block to plain text. Entities are decoded and
/// `<script>`/`<style>` bodies dropped; tables come out one cell per line
/// (raw mode) so section keywords stay contiguous.
pub fn strip_markup(html: &str) -> String {
    match html2text::config::plain()
        .raw_mode(true)
        .string_from_read(html.as_bytes(), RENDER_WIDTH)
    {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "could not render report markup, keeping raw text");
            html.to_string()
        }
    }
}

/// Cut the shareholder-benefit section out of the share-procedures text
/// block. `None` when no opener keyword is present.
pub fn extract_benefits_section(text: &str) -> Option<&str> {
    let start = BENEFIT_KEYWORDS.iter().find_map(|kw| text.find(kw))?;

    let search_from = text[start..]
        .char_indices()
        .nth(MIN_SECTION_CHARS)
        .map(|(offset, _)| start + offset)
        .unwrap_or(text.len());

    let end = BENEFIT_END_KEYWORDS
        .iter()
        .filter_map(|kw| text[search_from..].find(kw).map(|idx| search_from + idx))
        .min()
        .unwrap_or(text.len());

    Some(text[start..end].trim())
}

// ============================================================================
// REPORT TIMING
// ============================================================================

/// Estimated filing date of the latest annual report: reports are due three
/// months after fiscal year end, so assume the last day of that month, in the
/// previous year until that month has passed.
pub fn estimate_report_date(fiscal_month: u32, today: NaiveDate) -> Result<NaiveDate> {
    if !(1..=12).contains(&fiscal_month) {
        return Err(MalformedInput::InvalidDate(format!("fiscal month {fiscal_month}")).into());
    }

    let report_month = (fiscal_month + 2) % 12 + 1;
    let report_year = if today.month() > report_month {
        today.year()
    } else {
        today.year() - 1
    };

    last_day_of_month(report_year, report_month)
        .ok_or_else(|| MalformedInput::InvalidDate(format!("{report_year}-{report_month}")).into())
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).map(|d| d - Duration::days(1))
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Load `info.json`. A missing or unreadable document starts fresh.
pub fn load_info(path: &Path, code: &SecurityCode) -> InfoDocument {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return InfoDocument::new(code),
    };

    match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable info document");
            InfoDocument::new(code)
        }
    }
}

/// Write `info.json` via temp file + rename
pub fn save_info(path: &Path, doc: &InfoDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "info document saved");
    Ok(())
}
