// =============================================================================
// OANDA v20 adapter — bid/ask FX candles over REST with bearer auth
// =============================================================================
//
// Endpoint: GET /v3/instruments/{instrument}/candles?price=BA
//
// OANDA quotes each candle twice (bid and ask). The normaliser averages the
// two sides into a mid-price candle. Candles still forming (`complete=false`)
// are dropped here; they will be picked up by a later incremental run.
//
// SECURITY: the API token is never logged or serialised.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::http;
use super::rate_window::{RequestWindow, RequestWindowSnapshot};
use super::{lookup, BrokerAdapter};
use crate::errors::BrokerError;
use crate::types::{canonical_pair, PriceBar, RawCandle, Timeframe};

const BROKER: &str = "OANDA";
const PRACTICE_URL: &str = "https://api-fxpractice.oanda.com";
const LIVE_URL: &str = "https://api-fxtrade.oanda.com";

/// Transport-level ceiling; the coordinator's operation timeout is usually
/// tighter.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Canonical pair -> OANDA instrument.
static INSTRUMENTS: &[(&str, &str)] = &[
    ("EURUSD", "EUR_USD"),
    ("GBPUSD", "GBP_USD"),
    ("USDJPY", "USD_JPY"),
    ("USDCHF", "USD_CHF"),
    ("USDCAD", "USD_CAD"),
    ("AUDUSD", "AUD_USD"),
    ("NZDUSD", "NZD_USD"),
    ("EURGBP", "EUR_GBP"),
    ("EURJPY", "EUR_JPY"),
    ("GBPJPY", "GBP_JPY"),
    ("XAUUSD", "XAU_USD"),
];

/// OANDA has no 3-minute granularity.
static GRANULARITIES: &[(Timeframe, &str)] = &[
    (Timeframe::M1, "M1"),
    (Timeframe::M5, "M5"),
    (Timeframe::M15, "M15"),
    (Timeframe::M30, "M30"),
    (Timeframe::H1, "H1"),
    (Timeframe::H4, "H4"),
    (Timeframe::D1, "D"),
];

/// Which OANDA deployment to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OandaEnvironment {
    #[default]
    Practice,
    Live,
}

impl OandaEnvironment {
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Practice => PRACTICE_URL,
            Self::Live => LIVE_URL,
        }
    }
}

impl std::str::FromStr for OandaEnvironment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "practice" | "demo" => Ok(Self::Practice),
            "live" | "trade" => Ok(Self::Live),
            other => anyhow::bail!("unknown OANDA environment '{other}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<OandaCandle>,
}

#[derive(Debug, Deserialize)]
struct OandaCandle {
    #[serde(default)]
    time: Option<String>,
    #[serde(default = "default_complete")]
    complete: bool,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    bid: Option<OandaOhlc>,
    #[serde(default)]
    ask: Option<OandaOhlc>,
    #[serde(default)]
    mid: Option<OandaOhlc>,
}

fn default_complete() -> bool {
    true
}

/// OANDA sends prices as decimal strings.
#[derive(Debug, Deserialize)]
struct OandaOhlc {
    o: String,
    h: String,
    l: String,
    c: String,
}

impl OandaOhlc {
    fn to_bar(&self) -> Option<PriceBar> {
        Some(PriceBar {
            open: self.o.parse().ok()?,
            high: self.h.parse().ok()?,
            low: self.l.parse().ok()?,
            close: self.c.parse().ok()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct OandaAdapter {
    client: reqwest::Client,
    token: String,
    base_url: String,
    window: RequestWindow,
}

impl OandaAdapter {
    pub fn new(
        token: impl Into<String>,
        environment: OandaEnvironment,
        requests_per_minute: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build OANDA HTTP client")?;

        debug!(base_url = environment.base_url(), "OandaAdapter initialised");

        Ok(Self {
            client,
            token: token.into(),
            base_url: environment.base_url().to_string(),
            window: RequestWindow::new(BROKER, requests_per_minute),
        })
    }

    /// Point the adapter at a different host (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn instrument_for(pair: &str) -> Result<&'static str, BrokerError> {
        let canonical = canonical_pair(pair);
        lookup(INSTRUMENTS, canonical.as_str()).ok_or_else(|| BrokerError::UnsupportedPair {
            broker: BROKER.to_string(),
            pair: pair.to_string(),
        })
    }

    pub fn granularity_for(timeframe: Timeframe) -> Result<&'static str, BrokerError> {
        lookup(GRANULARITIES, timeframe).ok_or_else(|| BrokerError::UnsupportedTimeframe {
            broker: BROKER.to_string(),
            timeframe: timeframe.to_string(),
        })
    }

    /// Decode a candles payload, dropping incomplete candles.
    fn parse_candles(body: &str) -> Result<Vec<RawCandle>, BrokerError> {
        let resp: CandlesResponse =
            serde_json::from_str(body).map_err(|e| BrokerError::Adapter {
                broker: BROKER.to_string(),
                status: None,
                message: format!("malformed candles payload: {e}"),
            })?;

        let mut out = Vec::with_capacity(resp.candles.len());
        for c in resp.candles {
            if !c.complete {
                debug!(time = ?c.time, "skipping incomplete candle");
                continue;
            }
            let timestamp = c.time.as_deref().and_then(|t| {
                DateTime::parse_from_rfc3339(t)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| warn!(time = t, error = %e, "unparseable candle time"))
                    .ok()
            });
            out.push(RawCandle {
                timestamp,
                bid: c.bid.as_ref().and_then(OandaOhlc::to_bar),
                ask: c.ask.as_ref().and_then(OandaOhlc::to_bar),
                mid: c.mid.as_ref().and_then(OandaOhlc::to_bar),
                volume: c.volume,
            });
        }

        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }
}

#[async_trait]
impl BrokerAdapter for OandaAdapter {
    fn broker_name(&self) -> &str {
        BROKER
    }

    #[instrument(skip(self), name = "oanda::validate_connection")]
    async fn validate_connection(&self) -> bool {
        let cancel = CancellationToken::new();
        if let Err(e) = self.window.acquire(&cancel).await {
            warn!(error = %e, "OANDA connection probe could not acquire a request slot");
            return false;
        }

        let url = format!("{}/v3/accounts", self.base_url);
        let request = self.client.get(&url).bearer_auth(&self.token);
        match http::send(BROKER, request, &cancel).await {
            Ok(reply) => match reply.error_for_status(BROKER) {
                None => {
                    debug!("OANDA connection validated");
                    true
                }
                Some(e) => {
                    warn!(error = %e, "OANDA connection probe rejected");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "OANDA connection probe failed");
                false
            }
        }
    }

    #[instrument(skip(self, cancel), name = "oanda::fetch_candles")]
    async fn fetch_candles(
        &self,
        pair: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandle>, BrokerError> {
        let instrument = Self::instrument_for(pair)?;
        let granularity = Self::granularity_for(timeframe)?;

        self.window.acquire(cancel).await?;

        let url = format!("{}/v3/instruments/{}/candles", self.base_url, instrument);
        let from_param = from.to_rfc3339_opts(SecondsFormat::Secs, true);
        let to_param = to.to_rfc3339_opts(SecondsFormat::Secs, true);
        let request = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("price", "BA"),
                ("granularity", granularity),
                ("from", from_param.as_str()),
                ("to", to_param.as_str()),
            ]);

        let reply = http::send(BROKER, request, cancel).await?;
        if let Some(err) = reply.error_for_status(BROKER) {
            return Err(err);
        }

        let candles = Self::parse_candles(&reply.body)?;
        debug!(instrument, granularity, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    fn request_window(&self) -> Option<RequestWindowSnapshot> {
        Some(self.window.snapshot())
    }
}

impl std::fmt::Debug for OandaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OandaAdapter")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("window", &self.window)
            .finish()
    }
}
