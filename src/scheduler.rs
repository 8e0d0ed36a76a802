// ⏱️ Harvest Scheduler - stalest-first, politely paced, one entity at a time
//
// Each run takes the N stalest active securities and, for each one:
//   1. pause (uniform random delay, stretched after rate limiting)
//   2. work out the fetch window from the last stored price date
//      (a split after that date forces a full-history refetch)
//   3. fetch prices + financials, merge both, then advance the price cursor
//   4. optionally refresh the qualitative info document
//
// A failing entity keeps its old cursor and is therefore first in line next
// run. Stopping between entities loses nothing.

use crate::db::{insert_event, Event};
use crate::entities::{SecurityCode, SecurityRegistry};
use crate::error::{Result, SentinelError, SourceError};
use crate::qualitative::{estimate_report_date, load_info, save_info, INFO_FILE};
use crate::sources::{MarketDataSource, QualitativeSource};
use crate::timeseries::{SeriesKind, SeriesStore};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

// ============================================================================
// PACING
// ============================================================================

/// Delay policy between requests to a rate-limited provider
pub trait Pacer {
    /// Called before every entity fetch
    fn pause(&mut self);

    /// The provider pushed back; slow down for the rest of the run
    fn on_rate_limited(&mut self, retry_after: Option<std::time::Duration>);
}

/// Sleeps a uniform random time in `[min, max]`, multiplied by a backoff
/// factor that doubles on every rate-limit signal (up to `max_factor`).
#[derive(Debug, Clone)]
pub struct RandomPacer {
    min: std::time::Duration,
    max: std::time::Duration,
    factor: f64,
    max_factor: f64,
    retry_after: Option<std::time::Duration>,
}

/// Longest single pause before backoff
pub const MAX_PAUSE_SECS: f64 = 3600.0;
pub const MAX_BACKOFF_FACTOR: f64 = 64.0;

impl RandomPacer {
    /// Out-of-range or non-finite inputs are clamped (NaN counts as zero).
    pub fn new(min_secs: f64, max_secs: f64, max_factor: f64) -> Self {
        let min = min_secs.max(0.0).min(MAX_PAUSE_SECS);
        let max = max_secs.max(min).min(MAX_PAUSE_SECS);
        RandomPacer {
            min: std::time::Duration::from_secs_f64(min),
            max: std::time::Duration::from_secs_f64(max),
            factor: 1.0,
            max_factor: max_factor.max(1.0).min(MAX_BACKOFF_FACTOR),
            retry_after: None,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Draw the next delay without sleeping
    pub fn next_delay(&self) -> std::time::Duration {
        let base = rand::rng().random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        let delay = std::time::Duration::from_secs_f64(base * self.factor);
        match self.retry_after {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }
}

impl Pacer for RandomPacer {
    fn pause(&mut self) {
        let delay = self.next_delay();
        self.retry_after = None;
        debug!(delay_ms = delay.as_millis() as u64, factor = self.factor, "pacing");
        std::thread::sleep(delay);
    }

    fn on_rate_limited(&mut self, retry_after: Option<std::time::Duration>) {
        self.factor = (self.factor * 2.0).min(self.max_factor);
        self.retry_after = retry_after;
        warn!(factor = self.factor, ?retry_after, "rate limited, backing off");
    }
}

/// No delay at all (tests, local drop directories)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacer;

impl Pacer for NoPacer {
    fn pause(&mut self) {}

    fn on_rate_limited(&mut self, _retry_after: Option<std::time::Duration>) {}
}

// ============================================================================
// BATCH REPORT
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct HarvestSettings {
    /// Price cursor age at which a security is due again
    pub stale_after: Duration,
    /// Minimum age of the info cursor before the qualitative step reruns
    pub info_refresh: Duration,
    /// Fiscal year end month used to estimate the annual report date
    pub fiscal_month: u32,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        HarvestSettings {
            stale_after: Duration::hours(20),
            info_refresh: Duration::days(7),
            fiscal_month: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestFailure {
    pub code: SecurityCode,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<HarvestFailure>,
    /// Price dates inserted or updated
    pub price_rows: usize,
    /// Entities whose financials changed
    pub financials_updated: usize,
    pub full_refetches: usize,
    pub info_updated: usize,
    pub info_failed: usize,
}

#[derive(Debug, Default)]
struct EntityOutcome {
    price_rows: usize,
    financials_changed: bool,
    full_refetch: bool,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct HarvestScheduler<'a, S: MarketDataSource, P: Pacer> {
    conn: &'a Connection,
    registry: SecurityRegistry<'a>,
    store: &'a SeriesStore,
    source: &'a S,
    pacer: P,
    qualitative: Option<&'a dyn QualitativeSource>,
    settings: HarvestSettings,
}

impl<'a, S: MarketDataSource, P: Pacer> HarvestScheduler<'a, S, P> {
    pub fn new(conn: &'a Connection, store: &'a SeriesStore, source: &'a S, pacer: P) -> Self {
        HarvestScheduler {
            conn,
            registry: SecurityRegistry::new(conn),
            store,
            source,
            pacer,
            qualitative: None,
            settings: HarvestSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: HarvestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_qualitative(mut self, source: &'a dyn QualitativeSource) -> Self {
        self.qualitative = Some(source);
        self
    }

    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    pub fn run_batch(&mut self, max_entities: usize) -> Result<BatchReport> {
        self.run_batch_at(max_entities, Utc::now())
    }

    /// Harvest up to `max_entities` of the stalest securities as of `now`.
    /// Only storage failures outside a single entity abort the batch.
    pub fn run_batch_at(&mut self, max_entities: usize, now: DateTime<Utc>) -> Result<BatchReport> {
        let targets = self.registry.list_stale_at(
            crate::entities::Cursor::Price,
            now,
            self.settings.stale_after,
            max_entities,
        )?;

        info!(source = self.source.name(), targets = targets.len(), "starting harvest batch");
        let mut report = BatchReport::default();

        for (i, code) in targets.iter().enumerate() {
            report.attempted += 1;
            self.pacer.pause();

            match self.harvest_one(code, now) {
                Ok(outcome) => {
                    report.succeeded += 1;
                    report.price_rows += outcome.price_rows;
                    report.financials_updated += outcome.financials_changed as usize;
                    report.full_refetches += outcome.full_refetch as usize;
                    info!(
                        code = %code,
                        progress = %format!("{}/{}", i + 1, targets.len()),
                        rows = outcome.price_rows,
                        "harvested"
                    );
                }
                Err(e) => {
                    self.record_failure(code, "harvest_failed", &e)?;
                    report.failed.push(HarvestFailure {
                        code: code.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            if self.qualitative.is_some() {
                match self.refresh_info(code, now) {
                    Ok(true) => report.info_updated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        self.record_failure(code, "info_failed", &e)?;
                        report.info_failed += 1;
                    }
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            price_rows = report.price_rows,
            info_updated = report.info_updated,
            "harvest batch finished"
        );
        Ok(report)
    }

    fn harvest_one(&self, code: &SecurityCode, now: DateTime<Utc>) -> Result<EntityOutcome> {
        let wrap = |source: SourceError| SentinelError::Source {
            code: code.to_string(),
            source,
        };

        let last_date = self.store.last_date(code, SeriesKind::Prices)?;
        let (since, full_refetch) = match last_date {
            None => (None, false),
            Some(last) => {
                let splits = self.source.fetch_split_dates(code).map_err(wrap)?;
                if splits.iter().any(|d| *d > last) {
                    info!(code = %code, %last, "split after last stored date, refetching full history");
                    (None, true)
                } else {
                    (last.succ_opt(), false)
                }
            }
        };

        // Fetch everything before writing anything
        let prices = self.source.fetch_prices(code, since).map_err(wrap)?;
        let financials = self.source.fetch_financials(code).map_err(wrap)?;

        let price_outcome = self.store.merge(code, SeriesKind::Prices, &prices)?;
        let financials_changed = if financials.is_empty() {
            false
        } else {
            let outcome = self.store.merge(code, SeriesKind::Financials, &financials)?;
            outcome.inserted + outcome.updated > 0
        };

        self.registry.mark_price_harvested(code, now)?;

        Ok(EntityOutcome {
            price_rows: price_outcome.inserted + price_outcome.updated,
            financials_changed,
            full_refetch,
        })
    }

    /// Returns true when the info document was rewritten
    fn refresh_info(&self, code: &SecurityCode, now: DateTime<Utc>) -> Result<bool> {
        let Some(qualitative) = self.qualitative else {
            return Ok(false);
        };
        if !self
            .registry
            .info_is_stale_at(code, now, self.settings.info_refresh)?
        {
            return Ok(false);
        }

        let today: NaiveDate = now.date_naive();
        let target = estimate_report_date(self.settings.fiscal_month, today)?;
        let report = qualitative.fetch(code, target).map_err(|source| SentinelError::Source {
            code: code.to_string(),
            source,
        })?;

        let updated = match report.filter(|r| !r.is_empty()) {
            Some(report) => {
                let path = self.store.entity_dir(code).join(INFO_FILE);
                let mut doc = load_info(&path, code);
                doc.apply_report(&report, today);
                save_info(&path, &doc)?;
                debug!(code = %code, fiscal_year_end = %report.fiscal_year_end, "info document updated");
                true
            }
            None => {
                debug!(code = %code, %target, "no annual report filed");
                false
            }
        };

        // Checked either way; the next look is one refresh interval away
        self.registry.mark_info_harvested(code, now)?;
        Ok(updated)
    }

    fn record_failure(&mut self, code: &SecurityCode, event_type: &str, err: &SentinelError) -> Result<()> {
        if let SentinelError::Source {
            source: SourceError::RateLimited { retry_after },
            ..
        } = err
        {
            self.pacer.on_rate_limited(*retry_after);
        }

        warn!(code = %code, error = %err, "{event_type}");
        insert_event(
            self.conn,
            &Event::new(
                event_type,
                "security",
                code.as_str(),
                serde_json::json!({ "reason": err.to_string() }),
                "scheduler",
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{format_timestamp, get_recent_events, setup_database};
    use crate::entities::SecurityUpdate;
    use crate::sources::QualitativeReport;
    use crate::timeseries::SeriesRow;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    fn code(raw: &str) -> SecurityCode {
        SecurityCode::parse(raw).unwrap()
    }

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    /// In-memory market data with scripted failures
    #[derive(Default)]
    struct FakeSource {
        prices: HashMap<String, Vec<SeriesRow>>,
        splits: HashMap<String, Vec<NaiveDate>>,
        failing: HashSet<String>,
        rate_limited: HashSet<String>,
        calls: RefCell<Vec<(String, Option<NaiveDate>)>>,
    }

    impl FakeSource {
        fn with_prices(mut self, c: &str, days: &[u32]) -> Self {
            let rows = days.iter().map(|day| SeriesRow::new(d(4, *day)).with("Close", *day as f64)).collect();
            self.prices.insert(c.to_string(), rows);
            self
        }
    }

    impl MarketDataSource for FakeSource {
        fn fetch_prices(&self, code: &SecurityCode, since: Option<NaiveDate>) -> Result<Vec<SeriesRow>, SourceError> {
            self.calls.borrow_mut().push((code.to_string(), since));
            if self.rate_limited.contains(code.as_str()) {
                return Err(SourceError::RateLimited { retry_after: None });
            }
            if self.failing.contains(code.as_str()) {
                return Err(SourceError::Unavailable("timeout".to_string()));
            }
            let rows = self.prices.get(code.as_str()).cloned().unwrap_or_default();
            Ok(rows.into_iter().filter(|r| since.map_or(true, |s| r.date >= s)).collect())
        }

        fn fetch_financials(&self, _code: &SecurityCode) -> Result<Vec<SeriesRow>, SourceError> {
            Ok(vec![SeriesRow::new(d(3, 31)).with("Total Revenue", 1.0e9)])
        }

        fn fetch_split_dates(&self, code: &SecurityCode) -> Result<Vec<NaiveDate>, SourceError> {
            Ok(self.splits.get(code.as_str()).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct CountingPacer {
        pauses: usize,
        rate_limits: usize,
    }

    impl Pacer for CountingPacer {
        fn pause(&mut self) {
            self.pauses += 1;
        }

        fn on_rate_limited(&mut self, _retry_after: Option<std::time::Duration>) {
            self.rate_limits += 1;
        }
    }

    fn setup(codes: &[&str]) -> (Connection, tempfile::TempDir) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let registry = SecurityRegistry::new(&conn);
        for c in codes {
            registry.upsert(&SecurityUpdate::new(c)).unwrap();
        }
        (conn, tempfile::tempdir().unwrap())
    }

    #[test]
    fn test_failed_entity_does_not_stop_batch() {
        let (conn, dir) = setup(&["1301.T", "6758.T", "7203.T"]);
        let store = SeriesStore::new(dir.path());
        let mut source = FakeSource::default()
            .with_prices("1301.T", &[1, 2])
            .with_prices("7203.T", &[1, 2]);
        source.failing.insert("6758.T".to_string());

        let now = Utc::now();
        let mut scheduler = HarvestScheduler::new(&conn, &store, &source, NoPacer);
        let report = scheduler.run_batch_at(10, now).unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].code, code("6758.T"));
        assert_eq!(report.price_rows, 4);
        assert_eq!(report.financials_updated, 2);

        // Failed entity is first in line next time, even far in the future
        let registry = SecurityRegistry::new(&conn);
        let next = registry
            .list_stale_at(crate::entities::Cursor::Price, now + Duration::days(2), Duration::hours(20), 10)
            .unwrap();
        assert_eq!(next[0], code("6758.T"));

        assert!(!store.path(&code("6758.T"), SeriesKind::Prices).exists());
        assert_eq!(get_recent_events(&conn, "harvest_failed", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_second_run_fetches_incrementally() {
        let (conn, dir) = setup(&["7203.T"]);
        let store = SeriesStore::new(dir.path());
        let source = FakeSource::default().with_prices("7203.T", &[1, 2, 3]);

        let start = Utc::now();
        let mut scheduler = HarvestScheduler::new(&conn, &store, &source, NoPacer);
        scheduler.run_batch_at(10, start).unwrap();

        // Not stale yet
        let report = scheduler.run_batch_at(10, start + Duration::hours(1)).unwrap();
        assert_eq!(report.attempted, 0);

        let report = scheduler.run_batch_at(10, start + Duration::days(1)).unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.price_rows, 0);

        let calls = source.calls.borrow();
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[1].1, Some(d(4, 4)));
        assert_eq!(store.load(&code("7203.T"), SeriesKind::Prices).unwrap().len(), 3);
    }

    #[test]
    fn test_split_forces_full_refetch() {
        let (conn, dir) = setup(&["7203.T"]);
        let store = SeriesStore::new(dir.path());
        let mut source = FakeSource::default().with_prices("7203.T", &[1, 2]);

        let start = Utc::now();
        HarvestScheduler::new(&conn, &store, &source, NoPacer)
            .run_batch_at(10, start)
            .unwrap();

        source.splits.insert("7203.T".to_string(), vec![d(4, 10)]);
        let report = HarvestScheduler::new(&conn, &store, &source, NoPacer)
            .run_batch_at(10, start + Duration::days(1))
            .unwrap();

        assert_eq!(report.full_refetches, 1);
        assert_eq!(source.calls.borrow()[1].1, None);
    }

    #[test]
    fn test_rate_limit_signals_pacer() {
        let (conn, dir) = setup(&["1301.T", "7203.T"]);
        let store = SeriesStore::new(dir.path());
        let mut source = FakeSource::default().with_prices("7203.T", &[1]);
        source.rate_limited.insert("1301.T".to_string());

        let mut scheduler = HarvestScheduler::new(&conn, &store, &source, CountingPacer::default());
        let report = scheduler.run_batch_at(10, Utc::now()).unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(scheduler.pacer().pauses, 2);
        assert_eq!(scheduler.pacer().rate_limits, 1);
    }

    #[test]
    fn test_random_pacer_backoff_is_capped() {
        let mut pacer = RandomPacer::new(0.0, 0.0, 4.0);
        assert_eq!(pacer.factor(), 1.0);

        pacer.on_rate_limited(None);
        assert_eq!(pacer.factor(), 2.0);
        pacer.on_rate_limited(None);
        pacer.on_rate_limited(None);
        assert_eq!(pacer.factor(), 4.0);

        pacer.on_rate_limited(Some(std::time::Duration::from_millis(5)));
        assert_eq!(pacer.next_delay(), std::time::Duration::from_millis(5));
        pacer.pause();
        assert_eq!(pacer.next_delay(), std::time::Duration::ZERO);
    }

    #[test]
    fn test_random_pacer_clamps_unbounded_settings() {
        let mut pacer = RandomPacer::new(f64::NAN, f64::INFINITY, f64::INFINITY);
        for _ in 0..20 {
            pacer.on_rate_limited(None);
        }
        assert_eq!(pacer.factor(), MAX_BACKOFF_FACTOR);
        assert!(pacer.next_delay().as_secs_f64() <= MAX_PAUSE_SECS * MAX_BACKOFF_FACTOR);
    }

    #[test]
    fn test_random_pacer_stays_in_range() {
        let pacer = RandomPacer::new(0.01, 0.02, 8.0);
        for _ in 0..50 {
            let delay = pacer.next_delay().as_secs_f64();
            assert!((0.01..=0.02).contains(&delay), "delay {delay}");
        }
    }

    struct OneReport;

    impl QualitativeSource for OneReport {
        fn fetch(&self, _code: &SecurityCode, target: NaiveDate) -> Result<Option<QualitativeReport>, SourceError> {
            Ok(Some(QualitativeReport {
                fiscal_year_end: target.to_string(),
                dividend_policy: Some("安定配当".to_string()),
                ..Default::default()
            }))
        }
    }

    #[test]
    fn test_qualitative_step_respects_refresh_interval() {
        let (conn, dir) = setup(&["7203.T"]);
        let store = SeriesStore::new(dir.path());
        let source = FakeSource::default().with_prices("7203.T", &[1]);
        let qualitative = OneReport;

        let start = Utc::now();
        let mut scheduler = HarvestScheduler::new(&conn, &store, &source, NoPacer).with_qualitative(&qualitative);

        let report = scheduler.run_batch_at(10, start).unwrap();
        assert_eq!(report.info_updated, 1);
        assert!(dir.path().join("7203.T").join(INFO_FILE).exists());

        // Prices due again after a day, info only after a week
        let report = scheduler.run_batch_at(10, start + Duration::days(1)).unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.info_updated, 0);
    }

    struct UnreachableFilings;

    impl QualitativeSource for UnreachableFilings {
        fn fetch(&self, _code: &SecurityCode, _target: NaiveDate) -> Result<Option<QualitativeReport>, SourceError> {
            Err(SourceError::Unavailable("filing service down".to_string()))
        }
    }

    #[test]
    fn test_qualitative_failure_keeps_entity_succeeded() {
        let (conn, dir) = setup(&["7203.T"]);
        let store = SeriesStore::new(dir.path());
        let source = FakeSource::default().with_prices("7203.T", &[1, 2]);
        let qualitative = UnreachableFilings;

        let now = Utc::now();
        let report = HarvestScheduler::new(&conn, &store, &source, NoPacer)
            .with_qualitative(&qualitative)
            .run_batch_at(10, now)
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(report.failed.is_empty());
        assert_eq!(report.info_failed, 1);
        assert_eq!(report.info_updated, 0);

        let security = SecurityRegistry::new(&conn).get(&code("7203.T")).unwrap().unwrap();
        // Stored at microsecond precision
        assert_eq!(
            security.last_price_update.map(format_timestamp),
            Some(format_timestamp(now))
        );
        assert_eq!(security.last_info_update, None);

        assert_eq!(get_recent_events(&conn, "info_failed", 10).unwrap().len(), 1);
        assert!(get_recent_events(&conn, "harvest_failed", 10).unwrap().is_empty());
        assert!(!dir.path().join("7203.T").join(INFO_FILE).exists());
    }
}
