// 📒 Membership Ledger - append-only IN/OUT log per (security, index)
//
// Rules enforced on every append:
//   - the first event for a pair is IN (no event = not a member)
//   - each following event flips the state (IN, OUT, IN, ...)
//   - each following event is dated strictly after the previous one
//
// Nothing is ever updated or deleted. Corrections are new compensating
// events. Current membership is never cached; it is replayed from the log.

use crate::db::{format_timestamp, insert_event, parse_timestamp, Event};
use crate::entities::{SecurityCode, SecurityRegistry};
use crate::error::{Result, SentinelError};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{info, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// EVENT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::In => "IN",
            EventType::Out => "OUT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IN" => Some(EventType::In),
            "OUT" => Some(EventType::Out),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inclusion or exclusion of a security from an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub code: SecurityCode,
    pub index: String,
    pub event_type: EventType,
    pub event_date: NaiveDate,
}

impl MembershipEvent {
    pub fn new(code: SecurityCode, index: &str, event_type: EventType, event_date: NaiveDate) -> Self {
        MembershipEvent {
            code,
            index: index.to_string(),
            event_type,
            event_date,
        }
    }
}

/// A persisted event with its storage sequence number
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub seq: i64,
    pub event: MembershipEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Record of an applied composition snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub index: String,
    pub as_of: NaiveDate,
    /// SHA-256 over the sorted member codes
    pub fingerprint: String,
    pub member_count: usize,
    pub event_count: usize,
}

// ============================================================================
// PURE PROJECTION
// ============================================================================

/// Replay events (in any order) up to and including `as_of`. The last event
/// per security decides; securities without events are not members.
pub fn project_membership<'e>(
    events: impl IntoIterator<Item = &'e MembershipEvent>,
    as_of: NaiveDate,
) -> BTreeSet<SecurityCode> {
    let mut ordered: Vec<(usize, &MembershipEvent)> = events
        .into_iter()
        .filter(|e| e.event_date <= as_of)
        .enumerate()
        .collect();
    ordered.sort_by_key(|(pos, e)| (e.event_date, *pos));

    let mut state: BTreeMap<&SecurityCode, EventType> = BTreeMap::new();
    for (_, event) in ordered {
        state.insert(&event.code, event.event_type);
    }

    state
        .into_iter()
        .filter(|(_, t)| *t == EventType::In)
        .map(|(code, _)| code.clone())
        .collect()
}

/// Check that `next` may follow `last` for the same pair
fn check_transition(last: Option<&MembershipEvent>, next: &MembershipEvent) -> Result<(), String> {
    match last {
        None if next.event_type == EventType::Out => {
            Err("first event for a security must be IN".to_string())
        }
        None => Ok(()),
        Some(prev) if prev.event_type == next.event_type => Err(format!(
            "{} on {} would follow {} on {}",
            next.event_type, next.event_date, prev.event_type, prev.event_date
        )),
        Some(prev) if next.event_date <= prev.event_date => Err(format!(
            "{} on {} is not after previous {} on {}",
            next.event_type, next.event_date, prev.event_type, prev.event_date
        )),
        Some(_) => Ok(()),
    }
}

// ============================================================================
// AUDIT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FindingKind {
    /// Two consecutive events of the same type
    NotAlternating,
    /// History begins with OUT
    StartsWithOut,
    /// Two events for the pair on the same date
    SameDayEvents,
    /// Event references a code missing from the security master
    UnknownEntity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditFinding {
    pub kind: FindingKind,
    pub code: String,
    pub index: String,
    pub seq: i64,
    pub detail: String,
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger<'a> {
    conn: &'a Connection,
}

fn date_str(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date_col(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let code: String = row.get(1)?;
    let event_type: String = row.get(3)?;
    let event_date: String = row.get(4)?;
    let recorded_at: String = row.get(5)?;

    Ok(LedgerEntry {
        seq: row.get(0)?,
        event: MembershipEvent {
            code: SecurityCode::parse(&code).map_err(|_| rusqlite::Error::InvalidQuery)?,
            index: row.get(2)?,
            event_type: EventType::parse(&event_type).ok_or(rusqlite::Error::InvalidQuery)?,
            event_date: parse_date_col(&event_date)?,
        },
        recorded_at: parse_timestamp(&recorded_at).ok_or(rusqlite::Error::InvalidQuery)?,
    })
}

const ENTRY_COLUMNS: &str = "seq, code, index_name, event_type, event_date, recorded_at";

impl<'a> Ledger<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Ledger { conn }
    }

    /// Validate against the pair's last event, then write
    pub fn append(&self, event: &MembershipEvent) -> Result<i64> {
        self.insert_validated(event, Utc::now())
    }

    /// Append several events atomically; later events are validated against
    /// earlier ones in the same batch.
    pub fn append_all(&self, events: &[MembershipEvent]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        for event in events {
            self.insert_validated(event, now)?;
        }
        tx.commit()?;
        Ok(events.len())
    }

    /// Append a snapshot's events together with its snapshot record
    /// Events, the snapshot record and its audit row commit together or not
    /// at all.
    pub fn append_snapshot(&self, record: &SnapshotRecord, events: &[MembershipEvent], audit: &Event) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        for event in events {
            self.insert_validated(event, now)?;
        }
        self.conn.execute(
            "INSERT INTO index_snapshots (
                index_name, as_of, fingerprint, member_count, event_count, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.index,
                date_str(record.as_of),
                record.fingerprint,
                record.member_count as i64,
                record.event_count as i64,
                format_timestamp(now),
            ],
        )?;
        insert_event(self.conn, audit)?;
        tx.commit()?;
        Ok(events.len())
    }

    fn insert_validated(&self, event: &MembershipEvent, now: DateTime<Utc>) -> Result<i64> {
        let last = self.last_event(&event.code, &event.index)?;
        if let Err(detail) = check_transition(last.as_ref(), event) {
            warn!(code = %event.code, index = %event.index, %detail, "rejected membership event");
            return Err(SentinelError::InvariantViolation {
                code: event.code.to_string(),
                index: event.index.clone(),
                detail,
            });
        }

        self.conn.execute(
            "INSERT INTO membership_events (code, index_name, event_type, event_date, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.code.as_str(),
                event.index,
                event.event_type.as_str(),
                date_str(event.event_date),
                format_timestamp(now),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Last recorded event for one (security, index) pair
    pub fn last_event(&self, code: &SecurityCode, index: &str) -> Result<Option<MembershipEvent>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM membership_events
             WHERE code = ?1 AND index_name = ?2
             ORDER BY event_date DESC, seq DESC
             LIMIT 1"
        );
        let entry = self
            .conn
            .query_row(&sql, params![code.as_str(), index], entry_from_row)
            .optional()?;
        Ok(entry.map(|e| e.event))
    }

    /// Membership of `index` as of `as_of`, replayed from the log
    pub fn resolve_membership(&self, index: &str, as_of: NaiveDate) -> Result<BTreeSet<SecurityCode>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM membership_events
             WHERE index_name = ?1 AND event_date <= ?2
             ORDER BY event_date, seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![index, date_str(as_of)], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(project_membership(entries.iter().map(|e| &e.event), as_of))
    }

    pub fn latest_event_date(&self, index: &str) -> Result<Option<NaiveDate>> {
        self.max_date("SELECT MAX(event_date) FROM membership_events WHERE index_name = ?1", index)
    }

    pub fn latest_snapshot_date(&self, index: &str) -> Result<Option<NaiveDate>> {
        self.max_date("SELECT MAX(as_of) FROM index_snapshots WHERE index_name = ?1", index)
    }

    /// Latest date this index has anything recorded for (event or snapshot)
    pub fn latest_recorded_date(&self, index: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .latest_event_date(index)?
            .max(self.latest_snapshot_date(index)?))
    }

    fn max_date(&self, sql: &str, index: &str) -> Result<Option<NaiveDate>> {
        let raw: Option<String> = self.conn.query_row(sql, params![index], |row| row.get(0))?;
        raw.map(|s| parse_date_col(&s).map_err(SentinelError::from))
            .transpose()
    }

    pub fn snapshot_at(&self, index: &str, as_of: NaiveDate) -> Result<Option<SnapshotRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT index_name, as_of, fingerprint, member_count, event_count
                 FROM index_snapshots WHERE index_name = ?1 AND as_of = ?2",
                params![index, date_str(as_of)],
                |row| {
                    let as_of: String = row.get(1)?;
                    Ok(SnapshotRecord {
                        index: row.get(0)?,
                        as_of: parse_date_col(&as_of)?,
                        fingerprint: row.get(2)?,
                        member_count: row.get::<_, i64>(3)? as usize,
                        event_count: row.get::<_, i64>(4)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn events_for_index(&self, index: &str) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM membership_events
             WHERE index_name = ?1 ORDER BY event_date, code, seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![index], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn events_for(&self, code: &SecurityCode, index: &str) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM membership_events
             WHERE code = ?1 AND index_name = ?2 ORDER BY event_date, seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![code.as_str(), index], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Full history of one security, across every index
    pub fn events_for_code(&self, code: &SecurityCode) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM membership_events
             WHERE code = ?1 ORDER BY index_name, event_date, seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![code.as_str()], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn indexes(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT index_name FROM membership_events
             UNION SELECT index_name FROM index_snapshots
             ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Consistency audit over the whole log. Reports, never repairs.
    pub fn audit(&self, registry: &SecurityRegistry<'_>) -> Result<Vec<AuditFinding>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM membership_events
             ORDER BY index_name, code, event_date, seq"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map([], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut findings = Vec::new();
        let mut checked_codes: BTreeMap<SecurityCode, bool> = BTreeMap::new();
        let mut previous: Option<&LedgerEntry> = None;

        for entry in &entries {
            let event = &entry.event;
            let finding = |kind: FindingKind, detail: String| AuditFinding {
                kind,
                code: event.code.to_string(),
                index: event.index.clone(),
                seq: entry.seq,
                detail,
            };

            if !checked_codes.contains_key(&event.code) {
                let known = registry.exists(&event.code)?;
                checked_codes.insert(event.code.clone(), known);
                if !known {
                    findings.push(finding(
                        FindingKind::UnknownEntity,
                        "security is not in the master".to_string(),
                    ));
                }
            }

            let same_pair = previous
                .map(|p| p.event.code == event.code && p.event.index == event.index)
                .unwrap_or(false);

            match previous.filter(|_| same_pair) {
                None if event.event_type == EventType::Out => findings.push(finding(
                    FindingKind::StartsWithOut,
                    format!("history starts with OUT on {}", event.event_date),
                )),
                Some(prev) if prev.event.event_type == event.event_type => findings.push(finding(
                    FindingKind::NotAlternating,
                    format!(
                        "{} on {} follows {} on {}",
                        event.event_type, event.event_date, prev.event.event_type, prev.event.event_date
                    ),
                )),
                Some(prev) if prev.event.event_date == event.event_date => findings.push(finding(
                    FindingKind::SameDayEvents,
                    format!("two events on {}", event.event_date),
                )),
                _ => {}
            }

            previous = Some(entry);
        }

        if findings.is_empty() {
            info!(events = entries.len(), "ledger audit clean");
        } else {
            warn!(events = entries.len(), findings = findings.len(), "ledger audit found problems");
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::SecurityUpdate;
    use pretty_assertions::assert_eq;

    const INDEX: &str = "Nikkei225";

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn code(raw: &str) -> SecurityCode {
        SecurityCode::parse(raw).unwrap()
    }

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn ev(c: &str, t: EventType, date: NaiveDate) -> MembershipEvent {
        MembershipEvent::new(code(c), INDEX, t, date)
    }

    #[test]
    fn test_alternating_appends_accepted() {
        let conn = test_conn();
        let ledger = Ledger::new(&conn);

        ledger.append(&ev("7203.T", EventType::In, d(4, 1))).unwrap();
        ledger.append(&ev("7203.T", EventType::Out, d(10, 1))).unwrap();
        ledger.append(&ev("7203.T", EventType::In, d(12, 1))).unwrap();

        let types: Vec<EventType> = ledger
            .events_for_index(INDEX)
            .unwrap()
            .into_iter()
            .map(|e| e.event.event_type)
            .collect();
        assert_eq!(types, vec![EventType::In, EventType::Out, EventType::In]);
    }

    #[test]
    fn test_repeated_type_rejected() {
        let conn = test_conn();
        let ledger = Ledger::new(&conn);

        ledger.append(&ev("7203.T", EventType::In, d(4, 1))).unwrap();
        let err = ledger.append(&ev("7203.T", EventType::In, d(5, 1))).unwrap_err();

        assert!(err.is_invariant_violation());
        assert_eq!(ledger.events_for_index(INDEX).unwrap().len(), 1);
    }

    #[test]
    fn test_out_first_and_backdated_rejected() {
        let conn = test_conn();
        let ledger = Ledger::new(&conn);

        assert!(ledger
            .append(&ev("7203.T", EventType::Out, d(4, 1)))
            .unwrap_err()
            .is_invariant_violation());

        ledger.append(&ev("7203.T", EventType::In, d(4, 1))).unwrap();
        assert!(ledger
            .append(&ev("7203.T", EventType::Out, d(3, 1)))
            .unwrap_err()
            .is_invariant_violation());
        assert!(ledger
            .append(&ev("7203.T", EventType::Out, d(4, 1)))
            .unwrap_err()
            .is_invariant_violation());
    }

    #[test]
    fn test_pairs_are_independent_across_indexes() {
        let conn = test_conn();
        let ledger = Ledger::new(&conn);

        ledger.append(&ev("7203.T", EventType::In, d(4, 1))).unwrap();
        ledger
            .append(&MembershipEvent::new(code("7203.T"), "TOPIX100", EventType::In, d(4, 1)))
            .unwrap();

        assert_eq!(ledger.indexes().unwrap(), vec!["Nikkei225", "TOPIX100"]);
        assert_eq!(ledger.events_for_code(&code("7203.T")).unwrap().len(), 2);
        assert_eq!(ledger.events_for(&code("7203.T"), "TOPIX100").unwrap().len(), 1);
    }

    #[test]
    fn test_append_all_is_atomic() {
        let conn = test_conn();
        let ledger = Ledger::new(&conn);

        let batch = vec![
            ev("7203.T", EventType::In, d(4, 1)),
            ev("6758.T", EventType::In, d(4, 1)),
            ev("6758.T", EventType::In, d(5, 1)),
        ];
        assert!(ledger.append_all(&batch).unwrap_err().is_invariant_violation());
        assert!(ledger.events_for_index(INDEX).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_membership_replays_to_date() {
        let conn = test_conn();
        let ledger = Ledger::new(&conn);

        ledger
            .append_all(&[
                ev("7203.T", EventType::In, d(4, 1)),
                ev("6758.T", EventType::In, d(4, 1)),
                ev("6758.T", EventType::Out, d(10, 1)),
                ev("9984.T", EventType::In, d(10, 1)),
            ])
            .unwrap();

        let before = ledger.resolve_membership(INDEX, d(9, 30)).unwrap();
        assert_eq!(before, [code("6758.T"), code("7203.T")].into_iter().collect());

        let after = ledger.resolve_membership(INDEX, d(10, 1)).unwrap();
        assert_eq!(after, [code("7203.T"), code("9984.T")].into_iter().collect());

        assert!(ledger.resolve_membership(INDEX, d(3, 31)).unwrap().is_empty());
        assert_eq!(ledger.latest_event_date(INDEX).unwrap(), Some(d(10, 1)));
        assert_eq!(ledger.latest_event_date("TOPIX").unwrap(), None);
    }

    #[test]
    fn test_projection_ignores_input_order() {
        let events = vec![
            ev("7203.T", EventType::Out, d(10, 1)),
            ev("7203.T", EventType::In, d(4, 1)),
        ];
        assert!(project_membership(&events, d(12, 31)).is_empty());
        assert_eq!(project_membership(&events, d(5, 1)).len(), 1);
    }

    #[test]
    fn test_audit_flags_corrupt_history() {
        let conn = test_conn();
        let registry = SecurityRegistry::new(&conn);
        registry.upsert(&SecurityUpdate::new("7203.T")).unwrap();
        let ledger = Ledger::new(&conn);
        ledger.append(&ev("7203.T", EventType::In, d(4, 1))).unwrap();

        // Bypass validation to simulate a corrupt import
        for (c, t, date) in [
            ("7203.T", "IN", "2024-05-01"),
            ("7203.T", "OUT", "2024-05-01"),
            ("6758.T", "OUT", "2024-05-01"),
        ] {
            conn.execute(
                "INSERT INTO membership_events (code, index_name, event_type, event_date, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![c, INDEX, t, date, format_timestamp(Utc::now())],
            )
            .unwrap();
        }

        let kinds: Vec<FindingKind> = ledger
            .audit(&registry)
            .unwrap()
            .into_iter()
            .map(|f| f.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FindingKind::UnknownEntity,
                FindingKind::StartsWithOut,
                FindingKind::NotAlternating,
                FindingKind::SameDayEvents,
            ]
        );
    }
}
