use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::PathBuf;

use stock_sentinel::{
    get_recent_events, open_database, read_index_snapshot, read_universe_listing, DropDirQualitativeSource,
    DropDirSource, HarvestScheduler, Ledger, NoPacer, RandomPacer, SecurityCode, SecurityRegistry,
    SentinelConfig, SeriesStore, SnapshotDiffer,
};

#[derive(Debug, Parser)]
#[command(name = "sentinel", version, about = "Security master and index membership harvester")]
struct Cli {
    /// Config file (defaults to ./sentinel.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the data directory and database
    Init,
    /// Apply a full universe listing CSV
    Universe { csv: PathBuf },
    /// Apply an index composition snapshot CSV
    Snapshot {
        csv: PathBuf,
        #[arg(long)]
        index: Option<String>,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Harvest the stalest securities from the inbox
    Harvest {
        #[arg(long)]
        max: Option<usize>,
        /// Skip the polite delay between entities
        #[arg(long)]
        no_delay: bool,
        /// Also refresh qualitative info documents
        #[arg(long)]
        with_info: bool,
    },
    /// Current members of an index
    Members {
        #[arg(long)]
        index: Option<String>,
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Securities due for harvesting, stalest first
    Stale {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Check the membership ledger for inconsistencies
    Audit,
    /// Membership history and recent operational events for one security
    Events { code: String },
}

fn main() {
    if let Err(error) = run() {
        eprintln!("❌ sentinel error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = SentinelConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let conn = open_database(&config.database_path())
        .with_context(|| format!("failed to open {}", config.database_path().display()))?;

    match cli.command {
        Command::Init => {
            println!("✓ Database ready at {}", config.database_path().display());
            Ok(())
        }
        Command::Universe { csv } => run_universe(&conn, &config, &csv),
        Command::Snapshot { csv, index, as_of } => run_snapshot(&conn, &config, &csv, index, as_of),
        Command::Harvest { max, no_delay, with_info } => run_harvest(&conn, &config, max, no_delay, with_info),
        Command::Members { index, as_of } => run_members(&conn, &config, index, as_of),
        Command::Stale { limit } => run_stale(&conn, &config, limit),
        Command::Audit => run_audit(&conn),
        Command::Events { code } => run_events(&conn, &code),
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))
}

fn as_of_or_today(raw: Option<String>) -> Result<chrono::NaiveDate> {
    match raw {
        Some(raw) => Ok(stock_sentinel::listing::parse_date(&raw)?),
        None => Ok(Utc::now().date_naive()),
    }
}

fn run_universe(conn: &Connection, config: &SentinelConfig, csv: &std::path::Path) -> Result<()> {
    println!("📂 Loading universe listing...");
    let listing = read_universe_listing(csv)?;

    let outcome = SecurityRegistry::new(conn).apply_listing(&listing)?;

    let store = SeriesStore::new(&config.data_dir);
    for update in &listing {
        store.ensure_entity_dir(&SecurityCode::parse(&update.code)?)?;
    }

    println!("✓ {} new, {} updated", outcome.inserted, outcome.updated);
    println!("✓ {} deactivated", outcome.deactivated.len());
    Ok(())
}

fn run_snapshot(
    conn: &Connection,
    config: &SentinelConfig,
    csv: &std::path::Path,
    index: Option<String>,
    as_of: Option<String>,
) -> Result<()> {
    let index = index.unwrap_or_else(|| config.default_index.clone());
    let as_of = as_of_or_today(as_of)?;

    println!("📂 Loading {index} composition as of {as_of}...");
    let snapshot = read_index_snapshot(csv, &index, as_of)?;

    let store = SeriesStore::new(&config.data_dir);
    let outcome = SnapshotDiffer::new(conn).with_store(&store).apply(&snapshot)?;

    if outcome.already_applied {
        println!("✓ Snapshot already applied, nothing to do");
        return Ok(());
    }
    for event in &outcome.events {
        println!("  {} {}", event.event_type, event.code);
    }
    println!("✓ {} joined, {} left", outcome.joined(), outcome.left());
    Ok(())
}

fn run_harvest(
    conn: &Connection,
    config: &SentinelConfig,
    max: Option<usize>,
    no_delay: bool,
    with_info: bool,
) -> Result<()> {
    let max = max.unwrap_or(config.max_entities_per_run);
    let store = SeriesStore::new(&config.data_dir);
    let source = DropDirSource::new(&config.inbox_dir);
    let qualitative = DropDirQualitativeSource::new(&config.inbox_dir);

    println!("🌾 Harvesting up to {max} securities from {}", config.inbox_dir.display());

    let report = if no_delay {
        let mut scheduler =
            HarvestScheduler::new(conn, &store, &source, NoPacer).with_settings(config.harvest_settings());
        if with_info {
            scheduler = scheduler.with_qualitative(&qualitative);
        }
        scheduler.run_batch(max)?
    } else {
        let pacer = RandomPacer::new(config.min_delay_secs, config.max_delay_secs, config.max_backoff_factor);
        let mut scheduler =
            HarvestScheduler::new(conn, &store, &source, pacer).with_settings(config.harvest_settings());
        if with_info {
            scheduler = scheduler.with_qualitative(&qualitative);
        }
        scheduler.run_batch(max)?
    };

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Attempted:   {}", report.attempted);
    println!("✓ Succeeded:   {}", report.succeeded);
    println!("✓ Price rows:  {}", report.price_rows);
    println!("✓ Financials:  {}", report.financials_updated);
    if with_info {
        println!("✓ Info docs:   {} ({} failed)", report.info_updated, report.info_failed);
    }
    if !report.failed.is_empty() {
        println!("⚠️  Failed:     {}", report.failed.len());
        for failure in &report.failed {
            println!("   {} - {}", failure.code, failure.reason);
        }
    }
    Ok(())
}

fn run_members(conn: &Connection, config: &SentinelConfig, index: Option<String>, as_of: Option<String>) -> Result<()> {
    let index = index.unwrap_or_else(|| config.default_index.clone());
    let as_of = as_of_or_today(as_of)?;
    let registry = SecurityRegistry::new(conn);

    let members = Ledger::new(conn).resolve_membership(&index, as_of)?;
    println!("📊 {index} as of {as_of}: {} members", members.len());
    for code in &members {
        let name = registry.get(code)?.map(|s| s.name).unwrap_or_default();
        println!("  {code}  {name}");
    }
    Ok(())
}

fn run_stale(conn: &Connection, config: &SentinelConfig, limit: usize) -> Result<()> {
    let stale = SecurityRegistry::new(conn).list_stale(config.harvest_settings().stale_after, limit)?;
    println!("⏱️  {} securities due", stale.len());
    for code in &stale {
        println!("  {code}");
    }
    Ok(())
}

fn run_audit(conn: &Connection) -> Result<()> {
    let registry = SecurityRegistry::new(conn);
    let findings = Ledger::new(conn).audit(&registry)?;

    if findings.is_empty() {
        println!("✅ Ledger is consistent");
        return Ok(());
    }
    println!("⚠️  {} findings", findings.len());
    for finding in &findings {
        println!("  #{} {:?} {} {}: {}", finding.seq, finding.kind, finding.index, finding.code, finding.detail);
    }
    Ok(())
}

fn run_events(conn: &Connection, raw: &str) -> Result<()> {
    let code = SecurityCode::parse(raw).or_else(|_| SecurityCode::from_exchange_code(raw))?;

    println!("📜 Membership history for {code}");
    for entry in Ledger::new(conn).events_for_code(&code)? {
        let event = entry.event;
        println!("  {}  {:<4} {}", event.event_date, event.event_type.as_str(), event.index);
    }

    let recent: Vec<_> = get_recent_events(conn, "harvest_failed", 100)?
        .into_iter()
        .filter(|e| e.entity_id == code.as_str())
        .collect();
    if !recent.is_empty() {
        println!("\n⚠️  Recent harvest failures");
        for event in recent {
            println!("  {}  {}", event.timestamp.format("%Y-%m-%d %H:%M"), event.data["reason"]);
        }
    }
    Ok(())
}
