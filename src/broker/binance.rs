// =============================================================================
// Binance spot adapter — public klines over REST
// =============================================================================
//
// Endpoint: GET /api/v3/klines (no signature required)
//
// Binance caps a klines response at 1000 entries, so one fetch may page
// through the range; every page passes through the request window. HTTP 418
// (IP ban after ignoring 429s) is treated as a rate limit.
//
// Array indices of a kline entry:
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
//   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades, ...
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::http::{self, parse_retry_after, HttpReply};
use super::rate_window::{RequestWindow, RequestWindowSnapshot};
use super::{lookup, BrokerAdapter};
use crate::errors::BrokerError;
use crate::types::{canonical_pair, PriceBar, RawCandle, Timeframe};

const BROKER: &str = "BINANCE";
const BASE_URL: &str = "https://api.binance.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum klines per request.
const KLINES_PAGE_LIMIT: usize = 1000;

/// Binance's own weight budget is 6000/min; warn at 80 %.
const WEIGHT_WARN_THRESHOLD: u32 = 4800;

/// Canonical pair -> Binance symbol. USD pairs settle against USDT.
static SYMBOLS: &[(&str, &str)] = &[
    ("BTCUSD", "BTCUSDT"),
    ("ETHUSD", "ETHUSDT"),
    ("BNBUSD", "BNBUSDT"),
    ("XRPUSD", "XRPUSDT"),
    ("SOLUSD", "SOLUSDT"),
    ("BTCUSDT", "BTCUSDT"),
    ("ETHUSDT", "ETHUSDT"),
    ("BNBUSDT", "BNBUSDT"),
    ("XRPUSDT", "XRPUSDT"),
    ("SOLUSDT", "SOLUSDT"),
];

static INTERVALS: &[(Timeframe, &str)] = &[
    (Timeframe::M1, "1m"),
    (Timeframe::M3, "3m"),
    (Timeframe::M5, "5m"),
    (Timeframe::M15, "15m"),
    (Timeframe::M30, "30m"),
    (Timeframe::H1, "1h"),
    (Timeframe::H4, "4h"),
    (Timeframe::D1, "1d"),
];

pub struct BinanceAdapter {
    client: reqwest::Client,
    base_url: String,
    window: RequestWindow,
}

impl BinanceAdapter {
    pub fn new(requests_per_minute: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Binance HTTP client")?;

        debug!("BinanceAdapter initialised (base_url={BASE_URL})");

        Ok(Self {
            client,
            base_url: BASE_URL.to_string(),
            window: RequestWindow::new(BROKER, requests_per_minute),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn symbol_for(pair: &str) -> Result<&'static str, BrokerError> {
        let canonical = canonical_pair(pair);
        lookup(SYMBOLS, canonical.as_str()).ok_or_else(|| BrokerError::UnsupportedPair {
            broker: BROKER.to_string(),
            pair: pair.to_string(),
        })
    }

    pub fn interval_for(timeframe: Timeframe) -> Result<&'static str, BrokerError> {
        lookup(INTERVALS, timeframe).ok_or_else(|| BrokerError::UnsupportedTimeframe {
            broker: BROKER.to_string(),
            timeframe: timeframe.to_string(),
        })
    }

    /// Parse Binance's array-of-arrays klines payload. Malformed entries are
    /// skipped; entries with unparseable prices are kept without a price side
    /// so the normaliser rejects and counts them.
    fn parse_klines(body: &str) -> Result<Vec<RawCandle>, BrokerError> {
        let malformed = |message: String| BrokerError::Adapter {
            broker: BROKER.to_string(),
            status: None,
            message,
        };

        let root: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| malformed(format!("failed to parse klines response: {e}")))?;
        let raw = root
            .as_array()
            .ok_or_else(|| malformed("klines response is not an array".to_string()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else {
                warn!("skipping kline entry that is not an array");
                continue;
            };
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let timestamp = arr[0]
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

            let mid = (|| {
                Some(PriceBar {
                    open: parse_str_f64(&arr[1])?,
                    high: parse_str_f64(&arr[2])?,
                    low: parse_str_f64(&arr[3])?,
                    close: parse_str_f64(&arr[4])?,
                })
            })();

            candles.push(RawCandle {
                timestamp,
                bid: None,
                ask: None,
                mid,
                volume: parse_str_f64(&arr[5]),
            });
        }

        Ok(candles)
    }

    fn log_used_weight(headers: &HeaderMap) {
        let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        if weight >= WEIGHT_WARN_THRESHOLD {
            warn!(used_weight = weight, "Binance request weight above warning threshold");
        } else {
            debug!(used_weight_1m = weight, "Binance request weight");
        }
    }
}

/// Non-2xx mapping plus Binance's 418, sent once an IP keeps ignoring 429s.
fn reply_error(reply: &HttpReply) -> Option<BrokerError> {
    if reply.status.as_u16() == 418 {
        return Some(BrokerError::RateLimit {
            broker: BROKER.to_string(),
            retry_after: parse_retry_after(&reply.headers),
        });
    }
    reply.error_for_status(BROKER)
}

/// Start of the next klines page: one step past the last open time of a full
/// page. A short page means the range is exhausted.
fn next_page_start(page: &[RawCandle], step_ms: i64) -> Option<i64> {
    if page.len() < KLINES_PAGE_LIMIT {
        return None;
    }
    let last_open = page.iter().rev().find_map(|c| c.timestamp)?;
    Some(last_open.timestamp_millis() + step_ms)
}

/// Binance sends numeric values as JSON strings; accept plain numbers too.
fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl BrokerAdapter for BinanceAdapter {
    fn broker_name(&self) -> &str {
        BROKER
    }

    #[instrument(skip(self), name = "binance::validate_connection")]
    async fn validate_connection(&self) -> bool {
        let cancel = CancellationToken::new();
        if let Err(e) = self.window.acquire(&cancel).await {
            warn!(error = %e, "Binance connection probe could not acquire a request slot");
            return false;
        }

        let url = format!("{}/api/v3/ping", self.base_url);
        match http::send(BROKER, self.client.get(&url), &cancel).await {
            Ok(reply) => match reply.error_for_status(BROKER) {
                None => true,
                Some(e) => {
                    warn!(error = %e, "Binance connection probe rejected");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "Binance connection probe failed");
                false
            }
        }
    }

    #[instrument(skip(self, cancel), name = "binance::fetch_candles")]
    async fn fetch_candles(
        &self,
        pair: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandle>, BrokerError> {
        let symbol = Self::symbol_for(pair)?;
        let interval = Self::interval_for(timeframe)?;

        let url = format!("{}/api/v3/klines", self.base_url);
        let step_ms = timeframe.duration().num_milliseconds();
        // endTime is inclusive; the requested range is half-open.
        let end_ms = to.timestamp_millis() - 1;
        let mut cursor_ms = from.timestamp_millis();
        let mut candles = Vec::new();

        while cursor_ms <= end_ms {
            self.window.acquire(cancel).await?;

            let request = self.client.get(&url).query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", cursor_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", KLINES_PAGE_LIMIT.to_string()),
            ]);

            let reply = http::send(BROKER, request, cancel).await?;
            Self::log_used_weight(&reply.headers);
            if let Some(err) = reply_error(&reply) {
                return Err(err);
            }

            let page = Self::parse_klines(&reply.body)?;
            let next = next_page_start(&page, step_ms);
            candles.extend(page);

            match next {
                Some(ms) => cursor_ms = ms,
                None => break,
            }
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    fn request_window(&self) -> Option<RequestWindowSnapshot> {
        Some(self.window.snapshot())
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("base_url", &self.base_url)
            .field("window", &self.window)
            .finish()
    }
}
