// 🚨 Error taxonomy
//
// Four kinds of failure, each attributable to an entity, an index or a
// top-level input:
//   1. malformed input       -> rejected before any write
//   2. invariant violation   -> ledger write refused, surfaced for inspection
//   3. source unavailable    -> entity skipped, batch continues
//   4. rate limited          -> same as 3, plus a longer delay for the rest

use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = SentinelError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("malformed input: {0}")]
    Malformed(#[from] MalformedInput),

    #[error("invariant violation for {code} in {index}: {detail}")]
    InvariantViolation {
        code: String,
        index: String,
        detail: String,
    },

    #[error("source failure for {code}: {source}")]
    Source {
        code: String,
        #[source]
        source: SourceError,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] figment::Error),
}

impl SentinelError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, SentinelError::Malformed(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, SentinelError::InvariantViolation { .. })
    }
}

/// Inputs that are rejected outright. Nothing is written when one of these
/// is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedInput {
    #[error("invalid security code {0:?} (expected four characters plus .T, e.g. 7203.T)")]
    InvalidCode(String),

    #[error("snapshot for {index} dated {as_of} is not after the latest recorded date {latest}")]
    OutOfOrderSnapshot {
        index: String,
        as_of: NaiveDate,
        latest: NaiveDate,
    },

    #[error("universe listing contains no securities")]
    EmptyListing,

    #[error("snapshot for {0} contains no members")]
    EmptySnapshot(String),

    #[error("snapshot for {index} references unregistered securities: {codes:?}")]
    UnknownEntity { index: String, codes: Vec<String> },

    #[error("missing required columns: {0:?}")]
    MissingColumns(Vec<String>),

    #[error("invalid date {0:?}")]
    InvalidDate(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

/// Failure reported by an external data source for a single security.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited by source")]
    RateLimited { retry_after: Option<Duration> },
}
