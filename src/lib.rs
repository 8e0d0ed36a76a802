// Stock Sentinel - Core Library
// Security master, index membership ledger and incremental harvesting.
// Exposes all modules for use in the CLI, API server, and tests

pub mod config;
pub mod db;
pub mod differ;     // Index composition snapshots -> IN/OUT events
pub mod entities;   // Security master
pub mod error;
pub mod ledger;     // Append-only membership events
pub mod listing;    // Listing / composition CSV readers
pub mod normalize;
pub mod qualitative;
pub mod scheduler;  // Paced, stalest-first harvesting
pub mod sources;
pub mod timeseries; // Per-entity price and financial series

// Re-export commonly used types
pub use config::SentinelConfig;
pub use db::{
    Event,
    open_database, setup_database, insert_event,
    get_events_for_entity, get_recent_events,
};
pub use differ::{diff, IndexSnapshot, SnapshotDiffer, SnapshotOutcome};
pub use entities::{
    Cursor, ListingOutcome, Security, SecurityCode, SecurityRegistry, SecurityUpdate,
};
pub use error::{MalformedInput, Result, SentinelError, SourceError};
pub use ledger::{
    project_membership, AuditFinding, EventType, FindingKind, Ledger, LedgerEntry,
    MembershipEvent, SnapshotRecord,
};
pub use listing::{parse_index_members, parse_universe_listing, read_index_snapshot, read_universe_listing};
pub use normalize::normalize;
pub use qualitative::{estimate_report_date, InfoDocument};
pub use scheduler::{
    BatchReport, HarvestFailure, HarvestScheduler, HarvestSettings, NoPacer, Pacer, RandomPacer,
};
pub use sources::{
    DropDirQualitativeSource, DropDirSource, MarketDataSource, QualitativeReport, QualitativeSource,
};
pub use timeseries::{merge_rows, MergeOutcome, SeriesKind, SeriesRow, SeriesStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
