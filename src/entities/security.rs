// 🏢 Security Entity - Stable identity + classification + freshness
//
// "The code is IDENTITY (never changes), the name is a VALUE (can change)"
//
// - Created on first sighting in a full universe listing
// - Deactivated (never deleted) when missing from a later listing
// - Harvest cursors (last_price_update / last_info_update) rank fetch priority

use crate::db::{format_timestamp, insert_event, parse_timestamp, Event};
use crate::error::{MalformedInput, Result};
use crate::normalize::{normalize, normalize_opt};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Market suffix appended to every exchange code
pub const MARKET_SUFFIX: &str = ".T";

// ============================================================================
// SECURITY CODE
// ============================================================================

/// Ticker-like identifier: four characters (digit first, then digits or
/// upper-case letters) plus the `.T` suffix, e.g. `7203.T`, `130A.T`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecurityCode(String);

impl SecurityCode {
    pub fn parse(raw: &str) -> Result<Self, MalformedInput> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_suffix(MARKET_SUFFIX)
            .ok_or_else(|| MalformedInput::InvalidCode(raw.to_string()))?;

        let bytes = body.as_bytes();
        let well_formed = bytes.len() == 4
            && bytes[0].is_ascii_digit()
            && bytes[1..]
                .iter()
                .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase());

        if !well_formed {
            return Err(MalformedInput::InvalidCode(raw.to_string()));
        }

        Ok(SecurityCode(trimmed.to_string()))
    }

    /// Build a code from a bare exchange code as it appears in listings
    /// ("7203", "7203.0", "130A", "７２０３").
    pub fn from_exchange_code(raw: &str) -> Result<Self, MalformedInput> {
        let folded = normalize(raw).to_ascii_uppercase();
        let bare = folded.strip_suffix(".0").unwrap_or(&folded);
        Self::parse(&format!("{}{}", bare, MARKET_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exchange code without the market suffix ("7203.T" -> "7203")
    pub fn bare(&self) -> &str {
        &self.0[..self.0.len() - MARKET_SUFFIX.len()]
    }
}

impl fmt::Display for SecurityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SecurityCode {
    type Err = MalformedInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SecurityCode {
    type Error = MalformedInput;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SecurityCode> for String {
    fn from(code: SecurityCode) -> Self {
        code.0
    }
}

// ============================================================================
// SECURITY ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    /// Stable identity - NEVER changes
    pub code: SecurityCode,

    pub name: String,

    /// e.g. "プライム（内国株式）"
    pub market_segment: Option<String>,

    /// 33-sector classification
    pub sector_33: Option<String>,

    /// 17-sector classification
    pub sector_17: Option<String>,

    pub is_active: bool,

    pub last_updated: Option<DateTime<Utc>>,
    pub last_price_update: Option<DateTime<Utc>>,
    pub last_info_update: Option<DateTime<Utc>>,
}

/// Incoming record for an upsert. `None` fields keep whatever is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityUpdate {
    pub code: String,
    pub name: Option<String>,
    pub market_segment: Option<String>,
    pub sector_33: Option<String>,
    pub sector_17: Option<String>,
}

impl SecurityUpdate {
    pub fn new(code: &str) -> Self {
        SecurityUpdate {
            code: code.to_string(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_classification(mut self, segment: &str, sector_33: &str, sector_17: &str) -> Self {
        self.market_segment = Some(segment.to_string());
        self.sector_33 = Some(sector_33.to_string());
        self.sector_17 = Some(sector_17.to_string());
        self
    }
}

/// Which harvest cursor a staleness query ranks by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Price,
    Info,
}

impl Cursor {
    fn column(self) -> &'static str {
        match self {
            Cursor::Price => "last_price_update",
            Cursor::Info => "last_info_update",
        }
    }
}

/// Outcome of applying a full universe listing
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListingOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deactivated: Vec<SecurityCode>,
}

// ============================================================================
// SECURITY REGISTRY
// ============================================================================

/// SQLite-backed security master
pub struct SecurityRegistry<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "code, name, market_segment, sector_33, sector_17, is_active,
     last_updated, last_price_update, last_info_update";

fn security_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Security> {
    let code: String = row.get(0)?;
    let ts = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = row.get(idx)?;
        Ok(raw.as_deref().and_then(parse_timestamp))
    };

    Ok(Security {
        code: SecurityCode::parse(&code).map_err(|_| rusqlite::Error::InvalidQuery)?,
        name: row.get(1)?,
        market_segment: row.get(2)?,
        sector_33: row.get(3)?,
        sector_17: row.get(4)?,
        is_active: row.get(5)?,
        last_updated: ts(6)?,
        last_price_update: ts(7)?,
        last_info_update: ts(8)?,
    })
}

impl<'a> SecurityRegistry<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SecurityRegistry { conn }
    }

    /// Insert or merge one security. Returns true when the row is new.
    pub fn upsert(&self, update: &SecurityUpdate) -> Result<bool> {
        self.upsert_at(update, Utc::now())
    }

    pub fn upsert_at(&self, update: &SecurityUpdate, now: DateTime<Utc>) -> Result<bool> {
        let code = SecurityCode::parse(&update.code)?;
        let name = normalize_opt(update.name.as_deref());
        let segment = normalize_opt(update.market_segment.as_deref());
        let sector_33 = normalize_opt(update.sector_33.as_deref());
        let sector_17 = normalize_opt(update.sector_17.as_deref());
        let stamp = format_timestamp(now);

        let existed = self.exists(&code)?;
        if existed {
            self.conn.execute(
                "UPDATE securities SET
                    name = COALESCE(?2, name),
                    market_segment = COALESCE(?3, market_segment),
                    sector_33 = COALESCE(?4, sector_33),
                    sector_17 = COALESCE(?5, sector_17),
                    is_active = 1,
                    last_updated = ?6
                 WHERE code = ?1",
                params![code.as_str(), name, segment, sector_33, sector_17, stamp],
            )?;
        } else {
            self.conn.execute(
                "INSERT INTO securities (
                    code, name, market_segment, sector_33, sector_17, is_active, last_updated
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![
                    code.as_str(),
                    name.unwrap_or_default(),
                    segment,
                    sector_33,
                    sector_17,
                    stamp
                ],
            )?;
            debug!(code = %code, "registered new security");
        }

        Ok(!existed)
    }

    /// Flip `is_active` off for every active security not in `listed`.
    /// Rows are never deleted.
    pub fn deactivate_missing(&self, listed: &HashSet<SecurityCode>) -> Result<Vec<SecurityCode>> {
        let active = self.all(true)?;
        let mut deactivated = Vec::new();

        for security in active {
            if listed.contains(&security.code) {
                continue;
            }
            self.conn.execute(
                "UPDATE securities SET is_active = 0 WHERE code = ?1",
                params![security.code.as_str()],
            )?;
            deactivated.push(security.code);
        }

        Ok(deactivated)
    }

    /// Apply an authoritative full listing: upsert every row, deactivate the
    /// rest. All-or-nothing.
    pub fn apply_listing(&self, listing: &[SecurityUpdate]) -> Result<ListingOutcome> {
        if listing.is_empty() {
            return Err(MalformedInput::EmptyListing.into());
        }

        // Validate every code before touching the table
        let listed = listing
            .iter()
            .map(|u| SecurityCode::parse(&u.code))
            .collect::<Result<HashSet<_>, _>>()?;

        let now = Utc::now();
        let tx = self.conn.unchecked_transaction()?;
        let mut outcome = ListingOutcome::default();

        for update in listing {
            if self.upsert_at(update, now)? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }
        outcome.deactivated = self.deactivate_missing(&listed)?;

        insert_event(
            self.conn,
            &Event::new(
                "listing_applied",
                "universe",
                "securities",
                serde_json::json!({
                    "listed": listed.len(),
                    "inserted": outcome.inserted,
                    "deactivated": outcome.deactivated.len(),
                }),
                "registry",
            ),
        )?;
        tx.commit()?;

        info!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            deactivated = outcome.deactivated.len(),
            "universe listing applied"
        );

        Ok(outcome)
    }

    /// Active codes whose price cursor is null or older than `max_age`,
    /// never-harvested first, then oldest first.
    pub fn list_stale(&self, max_age: Duration, limit: usize) -> Result<Vec<SecurityCode>> {
        self.list_stale_at(Cursor::Price, Utc::now(), max_age, limit)
    }

    pub fn list_info_stale(&self, max_age: Duration, limit: usize) -> Result<Vec<SecurityCode>> {
        self.list_stale_at(Cursor::Info, Utc::now(), max_age, limit)
    }

    pub fn list_stale_at(
        &self,
        cursor: Cursor,
        now: DateTime<Utc>,
        max_age: Duration,
        limit: usize,
    ) -> Result<Vec<SecurityCode>> {
        let column = cursor.column();
        let threshold = format_timestamp(now - max_age);
        let sql = format!(
            "SELECT code FROM securities
             WHERE is_active = 1 AND ({column} IS NULL OR {column} < ?1)
             ORDER BY {column} IS NOT NULL, {column} ASC, code ASC
             LIMIT ?2"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let codes = stmt
            .query_map(params![threshold, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        codes
            .iter()
            .map(|c| SecurityCode::parse(c).map_err(Into::into))
            .collect()
    }

    /// Is the security's info cursor older than `max_age` (or unset)?
    pub fn info_is_stale(&self, code: &SecurityCode, max_age: Duration) -> Result<bool> {
        self.info_is_stale_at(code, Utc::now(), max_age)
    }

    pub fn info_is_stale_at(&self, code: &SecurityCode, now: DateTime<Utc>, max_age: Duration) -> Result<bool> {
        let security = self.get(code)?;
        Ok(match security.and_then(|s| s.last_info_update) {
            Some(at) => at < now - max_age,
            None => true,
        })
    }

    pub fn mark_price_harvested(&self, code: &SecurityCode, at: DateTime<Utc>) -> Result<()> {
        self.mark(Cursor::Price, code, at)
    }

    pub fn mark_info_harvested(&self, code: &SecurityCode, at: DateTime<Utc>) -> Result<()> {
        self.mark(Cursor::Info, code, at)
    }

    fn mark(&self, cursor: Cursor, code: &SecurityCode, at: DateTime<Utc>) -> Result<()> {
        let sql = format!("UPDATE securities SET {} = ?1 WHERE code = ?2", cursor.column());
        self.conn
            .execute(&sql, params![format_timestamp(at), code.as_str()])?;
        Ok(())
    }

    pub fn get(&self, code: &SecurityCode) -> Result<Option<Security>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM securities WHERE code = ?1");
        let security = self
            .conn
            .query_row(&sql, params![code.as_str()], security_from_row)
            .optional()?;
        Ok(security)
    }

    pub fn exists(&self, code: &SecurityCode) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM securities WHERE code = ?1",
                params![code.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All securities ordered by code
    pub fn all(&self, active_only: bool) -> Result<Vec<Security>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM securities {} ORDER BY code",
            if active_only { "WHERE is_active = 1" } else { "" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let securities = stmt
            .query_map([], security_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(securities)
    }

    pub fn count_active(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM securities WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
