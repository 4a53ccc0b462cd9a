//! Broker adapters: one per upstream candle provider.
//!
//! Every adapter maps pairs and timeframes through its own static table,
//! throttles itself through a private [`rate_window::RequestWindow`], and reports failures
//! as [`BrokerError`]s the coordinator can classify.

pub mod binance;
pub mod http;
pub mod oanda;
pub mod rate_window;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::errors::BrokerError;
use crate::types::{RawCandle, Timeframe};

pub use binance::BinanceAdapter;
pub use oanda::{OandaAdapter, OandaEnvironment};
pub use rate_window::RequestWindowSnapshot;

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Registry key, also used in logs and error messages.
    fn broker_name(&self) -> &str;

    /// Probe the upstream. Never fails; logs and returns `false` instead.
    async fn validate_connection(&self) -> bool;

    /// Fetch candles covering `[from, to)`, ordered by timestamp.
    ///
    /// Unsupported pairs and timeframes are rejected before any request is
    /// made. Implementations must stop waiting as soon as `cancel` fires.
    async fn fetch_candles(
        &self,
        pair: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandle>, BrokerError>;

    /// Current throttling state, for adapters that self-throttle.
    fn request_window(&self) -> Option<RequestWindowSnapshot> {
        None
    }
}

/// Look `key` up in a static broker table.
pub(crate) fn lookup<K: PartialEq + Copy, V: Copy>(table: &[(K, V)], key: K) -> Option<V> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}
