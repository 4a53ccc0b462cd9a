// =============================================================================
// Runtime Configuration — ingestion settings with atomic save
// =============================================================================
//
// Central configuration for the candle ingestion service: coordinator limits,
// trading sessions, broker throttles, the watchlist and the schedule of
// initial backfills and incremental refreshes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::OandaEnvironment;
use crate::ingestion::{CoordinatorConfig, IngestionConfig};
use crate::market_data::SessionConfig;
use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_oanda_rpm() -> u32 {
    100
}

fn default_binance_rpm() -> u32 {
    1_200
}

fn default_initial_backfill_days() -> i64 {
    30
}

fn default_backfill_priority() -> u8 {
    5
}

fn default_incremental_priority() -> u8 {
    2
}

fn default_incremental_interval_secs() -> u64 {
    60
}

fn default_stats_interval_secs() -> u64 {
    300
}

fn default_watchlist() -> Vec<WatchEntry> {
    vec![
        WatchEntry::new("OANDA", "EURUSD", Timeframe::M5, true),
        WatchEntry::new("OANDA", "GBPUSD", Timeframe::M5, true),
        WatchEntry::new("BINANCE", "BTCUSD", Timeframe::M1, false),
        WatchEntry::new("BINANCE", "ETHUSD", Timeframe::M1, false),
    ]
}

// =============================================================================
// Broker settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OandaSettings {
    /// The adapter is only built when `OANDA_API_TOKEN` is also present.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub environment: OandaEnvironment,

    #[serde(default = "default_oanda_rpm")]
    pub requests_per_minute: u32,
}

impl Default for OandaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: OandaEnvironment::default(),
            requests_per_minute: default_oanda_rpm(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinanceSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_binance_rpm")]
    pub requests_per_minute: u32,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_binance_rpm(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub oanda: OandaSettings,

    #[serde(default)]
    pub binance: BinanceSettings,
}

// =============================================================================
// Watchlist & scheduling
// =============================================================================

/// One series kept up to date by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub broker: String,
    pub pair: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub enable_session_filtering: bool,
}

impl WatchEntry {
    pub fn new(broker: &str, pair: &str, timeframe: Timeframe, enable_session_filtering: bool) -> Self {
        Self {
            broker: broker.to_string(),
            pair: pair.to_string(),
            timeframe,
            enable_session_filtering,
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig::new(&self.broker, &self.pair, self.timeframe)
            .with_session_filtering(self.enable_session_filtering)
    }
}

impl FromStr for WatchEntry {
    type Err = anyhow::Error;

    /// `broker:PAIR:timeframe`, e.g. `OANDA:EURUSD:5m`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();
        let [broker, pair, timeframe] = parts.as_slice() else {
            return Err(anyhow!("watch entry '{s}' is not broker:PAIR:timeframe"));
        };
        if broker.is_empty() || pair.is_empty() {
            return Err(anyhow!("watch entry '{s}' has an empty broker or pair"));
        }
        let timeframe: Timeframe = timeframe.parse()?;
        Ok(Self::new(&broker.to_uppercase(), &pair.to_uppercase(), timeframe, false))
    }
}

/// Parse a comma-separated watchlist (the `INGEST_WATCHLIST` format).
pub fn parse_watchlist(raw: &str) -> Result<Vec<WatchEntry>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<WatchEntry>())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// History requested for every watch entry at startup. 0 disables.
    #[serde(default = "default_initial_backfill_days")]
    pub initial_backfill_days: i64,

    #[serde(default = "default_backfill_priority")]
    pub backfill_priority: u8,

    #[serde(default = "default_incremental_priority")]
    pub incremental_priority: u8,

    #[serde(default = "default_incremental_interval_secs")]
    pub incremental_interval_secs: u64,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            initial_backfill_days: default_initial_backfill_days(),
            backfill_priority: default_backfill_priority(),
            incremental_priority: default_incremental_priority(),
            incremental_interval_secs: default_incremental_interval_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub brokers: BrokerSettings,

    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<WatchEntry>,

    #[serde(default)]
    pub scheduling: SchedulingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            session: SessionConfig::default(),
            brokers: BrokerSettings::default(),
            watchlist: default_watchlist(),
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            watchlist = config.watchlist.len(),
            max_concurrent_jobs = config.coordinator.max_concurrent_jobs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `OANDA_ENVIRONMENT` and `INGEST_WATCHLIST` when set.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("OANDA_ENVIRONMENT") {
            self.brokers.oanda.environment = env
                .parse()
                .context("invalid OANDA_ENVIRONMENT")?;
        }
        if let Ok(raw) = std::env::var("INGEST_WATCHLIST") {
            let watchlist = parse_watchlist(&raw).context("invalid INGEST_WATCHLIST")?;
            if !watchlist.is_empty() {
                self.watchlist = watchlist;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.coordinator.max_concurrent_jobs, 4);
        assert_eq!(cfg.coordinator.max_retries, 3);
        assert_eq!(cfg.brokers.oanda.environment, OandaEnvironment::Practice);
        assert_eq!(cfg.brokers.binance.requests_per_minute, 1_200);
        assert_eq!(cfg.watchlist.len(), 4);
        assert_eq!(cfg.watchlist[0].broker, "OANDA");
        assert!(cfg.watchlist[0].enable_session_filtering);
        assert_eq!(cfg.scheduling.initial_backfill_days, 30);
        assert_eq!(cfg.session.timezone, "UTC");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "coordinator": { "max_concurrent_jobs": 1 },
            "watchlist": [ { "broker": "BINANCE", "pair": "SOLUSD", "timeframe": "15m" } ]
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.coordinator.max_concurrent_jobs, 1);
        assert_eq!(cfg.coordinator.job_timeout_ms, 600_000);
        assert_eq!(cfg.watchlist.len(), 1);
        assert_eq!(cfg.watchlist[0].timeframe, Timeframe::M15);
        assert!(!cfg.watchlist[0].enable_session_filtering);
        assert!(cfg.brokers.oanda.enabled);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("candle-ingest-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ingest_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.scheduling.incremental_interval_secs = 15;
        cfg.save(&path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/nonexistent/ingest_config.json").is_err());
    }

    #[test]
    fn watchlist_parses_broker_pair_timeframe() {
        let list = parse_watchlist("oanda:eurusd:5m, BINANCE:BTCUSD:1h,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], WatchEntry::new("OANDA", "EURUSD", Timeframe::M5, false));
        assert_eq!(list[1].timeframe, Timeframe::H1);

        assert!(parse_watchlist("OANDA:EURUSD").is_err());
        assert!(parse_watchlist("OANDA:EURUSD:2h").is_err());
        assert!(parse_watchlist(":EURUSD:5m").is_err());
    }

    #[test]
    fn watch_entry_builds_ingestion_config() {
        let entry = WatchEntry::new("OANDA", "EURUSD", Timeframe::M5, true);
        let cfg = entry.ingestion_config();
        assert_eq!(cfg.broker, "OANDA");
        assert!(cfg.enable_session_filtering);
    }
}
