// 🔀 Snapshot Differ - turns full index compositions into IN/OUT events
//
// Index providers publish the whole member list, never the changes. Each
// snapshot is compared with the membership the ledger resolves for the same
// date and only the difference is appended:
//
//   members - current  -> IN
//   current - members  -> OUT
//
// Identical snapshots therefore produce nothing, whether re-submitted for the
// same date (fingerprint match) or a later one (resolved state already equal).

use crate::db::Event;
use crate::entities::{SecurityCode, SecurityRegistry};
use crate::error::{MalformedInput, Result};
use crate::ledger::{EventType, Ledger, MembershipEvent, SnapshotRecord};
use crate::timeseries::SeriesStore;
use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Full composition of one index on one date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub index: String,
    pub as_of: NaiveDate,
    pub members: BTreeSet<SecurityCode>,
}

impl IndexSnapshot {
    pub fn new(index: &str, as_of: NaiveDate, members: BTreeSet<SecurityCode>) -> Self {
        IndexSnapshot {
            index: index.to_string(),
            as_of,
            members,
        }
    }

    /// SHA-256 over the sorted member codes, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for code in &self.members {
            hasher.update(code.as_str().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Events implied by moving from `current` to the snapshot's member set,
/// ordered by code.
pub fn diff(snapshot: &IndexSnapshot, current: &BTreeSet<SecurityCode>) -> Vec<MembershipEvent> {
    let mut events: Vec<MembershipEvent> = snapshot
        .members
        .symmetric_difference(current)
        .map(|code| {
            let event_type = if snapshot.members.contains(code) {
                EventType::In
            } else {
                EventType::Out
            };
            MembershipEvent::new(code.clone(), &snapshot.index, event_type, snapshot.as_of)
        })
        .collect();

    // symmetric_difference already yields ascending codes; keep it explicit
    events.sort_by(|a, b| a.code.cmp(&b.code));
    events
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotOutcome {
    pub index: String,
    pub as_of: NaiveDate,
    pub events: Vec<MembershipEvent>,
    /// True when the same snapshot had already been applied for this date
    pub already_applied: bool,
}

impl SnapshotOutcome {
    pub fn joined(&self) -> usize {
        self.events.iter().filter(|e| e.event_type == EventType::In).count()
    }

    pub fn left(&self) -> usize {
        self.events.iter().filter(|e| e.event_type == EventType::Out).count()
    }
}

pub struct SnapshotDiffer<'a> {
    registry: SecurityRegistry<'a>,
    ledger: Ledger<'a>,
    store: Option<&'a SeriesStore>,
}

impl<'a> SnapshotDiffer<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        SnapshotDiffer {
            registry: SecurityRegistry::new(conn),
            ledger: Ledger::new(conn),
            store: None,
        }
    }

    /// Create per-entity data directories for every snapshot member
    pub fn with_store(mut self, store: &'a SeriesStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate, diff and append one snapshot. Nothing is written unless every
    /// check passes; events, the snapshot record and its audit row land in one
    /// transaction.
    pub fn apply(&self, snapshot: &IndexSnapshot) -> Result<SnapshotOutcome> {
        if snapshot.members.is_empty() {
            return Err(MalformedInput::EmptySnapshot(snapshot.index.clone()).into());
        }

        let mut unknown = Vec::new();
        for code in &snapshot.members {
            if !self.registry.exists(code)? {
                unknown.push(code.to_string());
            }
        }
        if !unknown.is_empty() {
            warn!(index = %snapshot.index, unknown = unknown.len(), "snapshot references unregistered securities");
            return Err(MalformedInput::UnknownEntity {
                index: snapshot.index.clone(),
                codes: unknown,
            }
            .into());
        }

        let fingerprint = snapshot.fingerprint();

        if let Some(latest) = self.ledger.latest_recorded_date(&snapshot.index)? {
            if snapshot.as_of == latest {
                let same = self
                    .ledger
                    .snapshot_at(&snapshot.index, latest)?
                    .map(|r| r.fingerprint == fingerprint)
                    .unwrap_or(false);
                if same {
                    info!(index = %snapshot.index, as_of = %snapshot.as_of, "snapshot already applied");
                    return Ok(SnapshotOutcome {
                        index: snapshot.index.clone(),
                        as_of: snapshot.as_of,
                        events: Vec::new(),
                        already_applied: true,
                    });
                }
            }
            if snapshot.as_of <= latest {
                return Err(MalformedInput::OutOfOrderSnapshot {
                    index: snapshot.index.clone(),
                    as_of: snapshot.as_of,
                    latest,
                }
                .into());
            }
        }

        let current = self.ledger.resolve_membership(&snapshot.index, snapshot.as_of)?;
        let events = diff(snapshot, &current);

        let record = SnapshotRecord {
            index: snapshot.index.clone(),
            as_of: snapshot.as_of,
            fingerprint,
            member_count: snapshot.members.len(),
            event_count: events.len(),
        };
        let joined = events.iter().filter(|e| e.event_type == EventType::In).count();
        let audit = Event::new(
            "snapshot_applied",
            "index",
            &snapshot.index,
            serde_json::json!({
                "as_of": snapshot.as_of.to_string(),
                "members": record.member_count,
                "joined": joined,
                "left": events.len() - joined,
            }),
            "differ",
        );
        self.ledger.append_snapshot(&record, &events, &audit)?;

        let outcome = SnapshotOutcome {
            index: snapshot.index.clone(),
            as_of: snapshot.as_of,
            events,
            already_applied: false,
        };

        // Every member gets a directory, not only the ones joining today
        if let Some(store) = self.store {
            for code in &snapshot.members {
                store.ensure_entity_dir(code)?;
            }
        }

        info!(
            index = %snapshot.index,
            as_of = %snapshot.as_of,
            joined = outcome.joined(),
            left = outcome.left(),
            "applied index snapshot"
        );
        Ok(outcome)
    }
}
