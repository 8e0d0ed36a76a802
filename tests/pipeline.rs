// End-to-end: listing -> snapshots -> harvest, all against a temp data dir

use chrono::{Duration, NaiveDate, Utc};
use pretty_assertions::assert_eq;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use stock_sentinel::{
    open_database, parse_index_members, parse_universe_listing, Cursor, DropDirSource, EventType, HarvestScheduler,
    IndexSnapshot, Ledger, MalformedInput, NoPacer, SecurityCode, SecurityRegistry, SentinelError, SeriesKind,
    SeriesStore, SnapshotDiffer,
};

const INDEX: &str = "Nikkei225";

fn code(raw: &str) -> SecurityCode {
    SecurityCode::parse(raw).unwrap()
}

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

fn listing_csv(rows: &[(&str, &str)]) -> String {
    let mut csv = String::from("コード,銘柄名,市場・商品区分,33業種区分,17業種区分\n");
    for (c, name) in rows {
        csv.push_str(&format!("{c},{name},プライム（内国株式）,輸送用機器,自動車・輸送機\n"));
    }
    csv
}

fn apply_listing(conn: &Connection, rows: &[(&str, &str)]) {
    let listing = parse_universe_listing(listing_csv(rows).as_bytes()).unwrap();
    SecurityRegistry::new(conn).apply_listing(&listing).unwrap();
}

fn snapshot(as_of: &str, csv: &str) -> IndexSnapshot {
    IndexSnapshot::new(INDEX, date(as_of), parse_index_members(csv.as_bytes()).unwrap())
}

fn drop_prices(inbox: &Path, c: &str, body: &str) {
    let dir = inbox.join(c);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("prices.csv"), body).unwrap();
}

#[test]
fn test_universe_listing_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_database(&dir.path().join("sentinel.db")).unwrap();
    let registry = SecurityRegistry::new(&conn);

    apply_listing(&conn, &[("1301", "極洋"), ("7203", "トヨタ自動車")]);
    apply_listing(&conn, &[("7203", "トヨタ自動車"), ("9984", "ソフトバンクグループ")]);

    let active: Vec<String> = registry.all(true).unwrap().into_iter().map(|s| s.code.to_string()).collect();
    assert_eq!(active, vec!["7203.T", "9984.T"]);

    let dropped = registry.get(&code("1301.T")).unwrap().unwrap();
    assert!(!dropped.is_active);
    assert_eq!(dropped.name, "極洋");
}

#[test]
fn test_snapshot_sequence_builds_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_database(&dir.path().join("sentinel.db")).unwrap();
    apply_listing(&conn, &[("1301", "極洋"), ("6758", "ソニーグループ"), ("7203", "トヨタ自動車")]);

    let differ = SnapshotDiffer::new(&conn);
    let ledger = Ledger::new(&conn);

    let t1 = differ
        .apply(&snapshot("2024-04-01", "コード,銘柄名\n1301,極洋\n6758,ソニーグループ\n"))
        .unwrap();
    assert_eq!(t1.joined(), 2);

    let t2 = differ
        .apply(&snapshot(
            "2024-10-01",
            "コード,銘柄名\n6758,ソニーグループ\n7203,トヨタ自動車\n,無断複製・転載を禁じます\n",
        ))
        .unwrap();
    let changes: Vec<(String, EventType)> =
        t2.events.iter().map(|e| (e.code.to_string(), e.event_type)).collect();
    assert_eq!(
        changes,
        vec![("1301.T".to_string(), EventType::Out), ("7203.T".to_string(), EventType::In)]
    );

    // History is replayable to any date
    let mid = ledger.resolve_membership(INDEX, date("2024-06-30")).unwrap();
    assert_eq!(mid, [code("1301.T"), code("6758.T")].into_iter().collect());

    // Late snapshot is refused and leaves the ledger untouched
    let before = ledger.events_for_index(INDEX).unwrap();
    let err = differ
        .apply(&snapshot("2024-07-01", "コード,銘柄名\n1301,極洋\n"))
        .unwrap_err();
    assert!(matches!(
        err,
        SentinelError::Malformed(MalformedInput::OutOfOrderSnapshot { .. })
    ));
    assert_eq!(ledger.events_for_index(INDEX).unwrap(), before);

    let registry = SecurityRegistry::new(&conn);
    assert!(ledger.audit(&registry).unwrap().is_empty());
}

#[test]
fn test_harvest_batch_resumes_with_failed_entity() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let inbox = dir.path().join("inbox");
    let conn = open_database(&data.join("sentinel.db")).unwrap();
    apply_listing(&conn, &[("1301", "極洋"), ("6758", "ソニーグループ"), ("7203", "トヨタ自動車")]);

    drop_prices(&inbox, "1301.T", "Date,Open,Close,Volume\n2024-04-01,3000,3010,1200\n2024-04-02,3010,3050,900\n");
    drop_prices(&inbox, "7203.T", "Date,Open,Close,Volume\n2024-04-01 00:00:00+09:00,3600,3620,50000\n");
    // 6758.T has no drop: the source reports it unavailable

    let store = SeriesStore::new(&data);
    let source = DropDirSource::new(&inbox);
    let now = Utc::now();

    let report = HarvestScheduler::new(&conn, &store, &source, NoPacer)
        .run_batch_at(100, now)
        .unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed[0].code, code("6758.T"));

    let rows = store.load(&code("7203.T"), SeriesKind::Prices).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("Close"), Some(3620.0));

    let registry = SecurityRegistry::new(&conn);
    let next = registry
        .list_stale_at(Cursor::Price, now + Duration::days(1), Duration::hours(20), 100)
        .unwrap();
    assert_eq!(next, vec![code("6758.T"), code("1301.T"), code("7203.T")]);

    // A re-delivered drop merges idempotently
    let report = HarvestScheduler::new(&conn, &store, &source, NoPacer)
        .run_batch_at(100, now + Duration::days(1))
        .unwrap();
    assert_eq!(report.price_rows, 0);
    assert_eq!(store.load(&code("1301.T"), SeriesKind::Prices).unwrap().len(), 2);
}
