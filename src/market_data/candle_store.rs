use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::types::{Candle, Timeframe};

// ---------------------------------------------------------------------------
// Repository contract
// ---------------------------------------------------------------------------

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A candle with the same `(pair, timeframe, timestamp)` already existed;
    /// nothing was written.
    Duplicate,
}

/// Storage boundary for candles.
///
/// `insert_candle` must be idempotent on `(pair, timeframe, timestamp)`: the
/// coordinator re-runs failed work, so the same candle may be delivered more
/// than once but must only ever be stored once.
#[async_trait]
pub trait CandleRepository: Send + Sync {
    async fn insert_candle(&self, candle: &Candle) -> Result<InsertOutcome>;

    async fn get_latest_timestamp(
        &self,
        pair: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>>;
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub pair: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(pair: &str, timeframe: Timeframe) -> Self {
        Self {
            pair: pair.to_string(),
            timeframe,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pair, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// MemoryCandleStore -- thread-safe in-process repository
// ---------------------------------------------------------------------------

/// Thread-safe candle store keyed by `(pair, timeframe)`, each series ordered
/// by timestamp. First write wins; later writes of the same key are ignored.
pub struct MemoryCandleStore {
    series: RwLock<HashMap<CandleKey, BTreeMap<DateTime<Utc>, Candle>>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, candle: &Candle) -> InsertOutcome {
        let key = CandleKey::new(&candle.pair, candle.timeframe);
        let mut map = self.series.write();
        let series = map.entry(key).or_default();

        if series.contains_key(&candle.timestamp) {
            trace!(pair = %candle.pair, ts = %candle.timestamp, "duplicate candle ignored");
            return InsertOutcome::Duplicate;
        }
        series.insert(candle.timestamp, candle.clone());
        InsertOutcome::Inserted
    }

    pub fn latest_timestamp(&self, key: &CandleKey) -> Option<DateTime<Utc>> {
        let map = self.series.read();
        map.get(key)
            .and_then(|series| series.keys().next_back().copied())
    }

    /// Candles in `[from, to)`, oldest first.
    #[cfg(test)]
    pub fn get_range(&self, key: &CandleKey, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Candle> {
        if from >= to {
            return Vec::new();
        }
        let map = self.series.read();
        match map.get(key) {
            Some(series) => series.range(from..to).map(|(_, c)| c.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Number of candles stored for a key.
    #[cfg(test)]
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.series.read();
        map.get(key).map_or(0, BTreeMap::len)
    }

    pub fn total_count(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }
}

impl Default for MemoryCandleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandleRepository for MemoryCandleStore {
    async fn insert_candle(&self, candle: &Candle) -> Result<InsertOutcome> {
        Ok(self.insert(candle))
    }

    async fn get_latest_timestamp(
        &self,
        pair: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.latest_timestamp(&CandleKey::new(pair, timeframe)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
