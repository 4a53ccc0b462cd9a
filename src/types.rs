// =============================================================================
// Shared types used across the ingestion pipeline
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Candle interval. Each broker maps these through its own static table and
/// may not support every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    /// Length of one candle.
    pub fn duration(self) -> Duration {
        match self {
            Self::M1 => Duration::minutes(1),
            Self::M3 => Duration::minutes(3),
            Self::M5 => Duration::minutes(5),
            Self::M15 => Duration::minutes(15),
            Self::M30 => Duration::minutes(30),
            Self::H1 => Duration::hours(1),
            Self::H4 => Duration::hours(4),
            Self::D1 => Duration::days(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == needle)
            .ok_or_else(|| anyhow::anyhow!("unknown timeframe '{s}'"))
    }
}

/// Open/high/low/close quadruple as reported by a provider for one price side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl PriceBar {
    /// Field-wise average of two bars (bid/ask → mid).
    pub fn midpoint(&self, other: &PriceBar) -> PriceBar {
        PriceBar {
            open: (self.open + other.open) / 2.0,
            high: (self.high + other.high) / 2.0,
            low: (self.low + other.low) / 2.0,
            close: (self.close + other.close) / 2.0,
        }
    }
}

/// Provider record as it left the adapter. Held only for the duration of a
/// fetch; the normaliser turns it into a [`Candle`] or rejects it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawCandle {
    pub timestamp: Option<DateTime<Utc>>,
    pub bid: Option<PriceBar>,
    pub ask: Option<PriceBar>,
    /// Providers that publish a single price series fill only this side.
    pub mid: Option<PriceBar>,
    pub volume: Option<f64>,
}

/// Canonical candle. Unique by `(pair, timeframe, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Canonical pair spelling: uppercase, separators removed (`eur/usd` → `EURUSD`).
pub fn canonical_pair(pair: &str) -> String {
    pair.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
