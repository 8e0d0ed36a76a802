// ⚙️ Configuration - layered with figment
//
// Precedence (highest wins):
//   1. SENTINEL_* environment variables (SENTINEL_MAX_ENTITIES_PER_RUN=50)
//   2. TOML file (--config path, else ./sentinel.toml when present)
//   3. Built-in defaults

use crate::error::{MalformedInput, Result};
use crate::scheduler::{HarvestSettings, MAX_BACKOFF_FACTOR, MAX_PAUSE_SECS};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "sentinel.toml";
pub const ENV_PREFIX: &str = "SENTINEL_";
pub const DATABASE_FILE: &str = "sentinel.db";

/// Upper bounds for the staleness windows (ten years)
const MAX_STALE_AFTER_HOURS: i64 = 24 * 3650;
const MAX_INFO_REFRESH_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Root for the database and per-security series folders
    pub data_dir: PathBuf,
    /// Where upstream fetchers drop raw files for the file-backed sources
    pub inbox_dir: PathBuf,
    pub max_entities_per_run: usize,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub max_backoff_factor: f64,
    pub stale_after_hours: i64,
    pub info_refresh_days: i64,
    pub fiscal_month: u32,
    pub default_index: String,
    pub server_addr: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        SentinelConfig {
            data_dir: PathBuf::from("data"),
            inbox_dir: PathBuf::from("inbox"),
            max_entities_per_run: 100,
            min_delay_secs: 1.0,
            max_delay_secs: 3.0,
            max_backoff_factor: 8.0,
            stale_after_hours: 20,
            info_refresh_days: 7,
            fiscal_month: 3,
            default_index: "Nikkei225".to_string(),
            server_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl SentinelConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would overflow durations or make no sense
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: String| -> Result<()> {
            Err(MalformedInput::InvalidSetting {
                key: key.to_string(),
                reason,
            }
            .into())
        };

        for (key, value) in [("min_delay_secs", self.min_delay_secs), ("max_delay_secs", self.max_delay_secs)] {
            if !(0.0..=MAX_PAUSE_SECS).contains(&value) {
                return invalid(key, format!("{value} is outside 0..={MAX_PAUSE_SECS}"));
            }
        }
        if self.min_delay_secs > self.max_delay_secs {
            return invalid("min_delay_secs", "greater than max_delay_secs".to_string());
        }
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&self.max_backoff_factor) {
            return invalid(
                "max_backoff_factor",
                format!("{} is outside 1..={MAX_BACKOFF_FACTOR}", self.max_backoff_factor),
            );
        }
        if !(0..=MAX_STALE_AFTER_HOURS).contains(&self.stale_after_hours) {
            return invalid(
                "stale_after_hours",
                format!("{} is outside 0..={MAX_STALE_AFTER_HOURS}", self.stale_after_hours),
            );
        }
        if !(0..=MAX_INFO_REFRESH_DAYS).contains(&self.info_refresh_days) {
            return invalid(
                "info_refresh_days",
                format!("{} is outside 0..={MAX_INFO_REFRESH_DAYS}", self.info_refresh_days),
            );
        }
        if !(1..=12).contains(&self.fiscal_month) {
            return invalid("fiscal_month", format!("{} is not a month", self.fiscal_month));
        }
        Ok(())
    }

    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        match path {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    figment = figment.merge(Toml::file(local));
                }
            }
        }

        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn harvest_settings(&self) -> HarvestSettings {
        HarvestSettings {
            stale_after: chrono::Duration::hours(self.stale_after_hours),
            info_refresh: chrono::Duration::days(self.info_refresh_days),
            fiscal_month: self.fiscal_month,
        }
    }
}
