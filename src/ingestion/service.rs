// =============================================================================
// Candle Ingestion Service — one backfill or incremental run against one broker
// =============================================================================
//
// Pipeline per sub-range:
//   adapter fetch → normalize → range check → validate → session filter → insert
//
// Every adapter call is bounded by the per-operation timeout and by the job's
// cancellation token. A failed sub-range is recorded in the result and its
// siblings carry on; errors that make further calls pointless (credentials,
// throttling, unsupported mapping, cancellation) end the run and propagate.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::BrokerAdapter;
use crate::errors::{BrokerError, TimeoutScope};
use crate::market_data::candle_store::{CandleRepository, InsertOutcome};
use crate::market_data::session::TradingSessionFilter;
use crate::market_data::validator;
use crate::types::{canonical_pair, RawCandle, Timeframe};

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// What to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub broker: String,
    pub pair: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub enable_session_filtering: bool,
}

impl IngestionConfig {
    pub fn new(broker: &str, pair: &str, timeframe: Timeframe) -> Self {
        Self {
            broker: broker.to_string(),
            pair: pair.to_string(),
            timeframe,
            enable_session_filtering: false,
        }
    }

    pub fn with_session_filtering(mut self, enabled: bool) -> Self {
        self.enable_session_filtering = enabled;
        self
    }
}

/// Per-call deadline plus the job-wide cancellation token.
#[derive(Debug, Clone)]
pub struct OperationLimits {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl OperationLimits {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

/// A sub-range whose fetch or persist failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeFailure {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionResult {
    pub total_fetched: u64,
    pub total_inserted: u64,
    /// Invalid, out-of-range or already stored.
    pub total_skipped: u64,
    /// Dropped by the session filter.
    pub total_filtered: u64,
    pub errors: Vec<RangeFailure>,
    pub processing_time_ms: u64,
    pub new_candles_found: bool,
    pub gap_detected: bool,
}

impl IngestionResult {
    /// Fold a later partial result into this one.
    pub fn absorb(&mut self, other: &IngestionResult) {
        self.total_fetched += other.total_fetched;
        self.total_inserted += other.total_inserted;
        self.total_skipped += other.total_skipped;
        self.total_filtered += other.total_filtered;
        self.errors.extend(other.errors.iter().cloned());
        self.processing_time_ms += other.processing_time_ms;
        self.new_candles_found |= other.new_candles_found;
        self.gap_detected |= other.gap_detected;
    }
}

// ---------------------------------------------------------------------------
// Tuning tables
// ---------------------------------------------------------------------------

/// Span of one backfill sub-range; each sub-range is one adapter call.
pub fn recommended_backfill_batch(timeframe: Timeframe) -> chrono::Duration {
    let days = match timeframe {
        Timeframe::M1 => 3,
        Timeframe::M3 => 7,
        Timeframe::M5 => 14,
        Timeframe::M15 => 30,
        Timeframe::M30 => 60,
        Timeframe::H1 => 120,
        Timeframe::H4 => 365,
        Timeframe::D1 => 1825,
    };
    chrono::Duration::days(days)
}

/// How far back an incremental update may reach.
pub fn recommended_incremental_lookback(timeframe: Timeframe) -> chrono::Duration {
    let hours = match timeframe {
        Timeframe::M1 => 6,
        Timeframe::M3 => 12,
        Timeframe::M5 => 24,
        Timeframe::M15 => 48,
        Timeframe::M30 => 72,
        Timeframe::H1 => 168,
        Timeframe::H4 => 720,
        Timeframe::D1 => 2160,
    };
    chrono::Duration::hours(hours)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct CandleIngestionService {
    adapter: Arc<dyn BrokerAdapter>,
    repository: Arc<dyn CandleRepository>,
    session_filter: Arc<dyn TradingSessionFilter>,
}

/// Outcome of one sub-range that made it through the fetch.
#[derive(Default)]
struct RangeTally {
    /// Earliest valid candle strictly newer than the caller's reference point.
    first_newer: Option<DateTime<Utc>>,
}

impl CandleIngestionService {
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        repository: Arc<dyn CandleRepository>,
        session_filter: Arc<dyn TradingSessionFilter>,
    ) -> Self {
        Self {
            adapter,
            repository,
            session_filter,
        }
    }

    pub fn broker_name(&self) -> &str {
        self.adapter.broker_name()
    }

    /// Ingest `[from, to)` in sub-ranges of the timeframe's recommended span.
    pub async fn backfill_historical_data(
        &self,
        config: &IngestionConfig,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        priority: u8,
        limits: &OperationLimits,
    ) -> Result<IngestionResult, BrokerError> {
        if from >= to {
            return Err(BrokerError::InvalidRequest(format!(
                "empty backfill range {from} .. {to}"
            )));
        }

        let started = Instant::now();
        let span = recommended_backfill_batch(config.timeframe);
        let mut result = IngestionResult::default();
        let mut succeeded = 0usize;
        let mut last_failure: Option<BrokerError> = None;

        debug!(
            broker = %config.broker,
            pair = %config.pair,
            timeframe = %config.timeframe,
            priority,
            %from,
            %to,
            "backfill started"
        );

        let mut cursor = from;
        while cursor < to {
            let end = (cursor + span).min(to);

            match self.ingest_range(config, cursor, end, None, limits, &mut result).await {
                Ok(_) => succeeded += 1,
                Err(e) if e.aborts_run() => return Err(e),
                Err(e) => {
                    warn!(
                        broker = %config.broker,
                        pair = %config.pair,
                        from = %cursor,
                        to = %end,
                        error = %e,
                        "sub-range failed, continuing with the next one"
                    );
                    result.errors.push(RangeFailure {
                        from: cursor,
                        to: end,
                        error: e.to_string(),
                    });
                    last_failure = Some(e);
                }
            }

            cursor = end;
        }

        if succeeded == 0 {
            if let Some(e) = last_failure {
                return Err(e);
            }
        }

        result.new_candles_found = result.total_inserted > 0;
        result.processing_time_ms = started.elapsed().as_millis() as u64;

        info!(
            broker = %config.broker,
            pair = %config.pair,
            timeframe = %config.timeframe,
            fetched = result.total_fetched,
            inserted = result.total_inserted,
            skipped = result.total_skipped,
            filtered = result.total_filtered,
            errors = result.errors.len(),
            "backfill finished"
        );

        Ok(result)
    }

    /// Fetch from the newest stored candle (bounded by the lookback) up to now.
    pub async fn smart_incremental_update(
        &self,
        config: &IngestionConfig,
        priority: u8,
        limits: &OperationLimits,
    ) -> Result<IngestionResult, BrokerError> {
        let started = Instant::now();
        let now = Utc::now();

        // Stored series are keyed by the canonical spelling.
        let latest = self
            .repository
            .get_latest_timestamp(&canonical_pair(&config.pair), config.timeframe)
            .await
            .map_err(|e| BrokerError::Storage(format!("{e:#}")))?;

        let floor = now - recommended_incremental_lookback(config.timeframe);
        let start = latest.map_or(floor, |ts| ts.max(floor));

        let mut result = IngestionResult::default();
        if start >= now {
            return Ok(result);
        }

        debug!(
            broker = %config.broker,
            pair = %config.pair,
            timeframe = %config.timeframe,
            priority,
            latest = ?latest,
            %start,
            "incremental update"
        );

        let tally = self
            .ingest_range(config, start, now, latest, limits, &mut result)
            .await?;

        if let (Some(last), Some(first)) = (latest, tally.first_newer) {
            if first - last > config.timeframe.duration() {
                result.gap_detected = true;
                warn!(
                    pair = %config.pair,
                    timeframe = %config.timeframe,
                    last_stored = %last,
                    first_fetched = %first,
                    "gap detected between stored and fetched candles"
                );
            }
        }

        result.new_candles_found = result.total_inserted > 0;
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn fetch_bounded(
        &self,
        config: &IngestionConfig,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limits: &OperationLimits,
    ) -> Result<Vec<RawCandle>, BrokerError> {
        let call = self.adapter.fetch_candles(
            &config.pair,
            config.timeframe,
            from,
            to,
            &limits.cancel,
        );

        tokio::select! {
            biased;
            _ = limits.cancel.cancelled() => Err(BrokerError::Cancelled),
            res = tokio::time::timeout(limits.timeout, call) => match res {
                Ok(inner) => inner,
                Err(_) => Err(BrokerError::Timeout {
                    scope: TimeoutScope::Operation,
                    elapsed_ms: limits.timeout.as_millis() as u64,
                }),
            },
        }
    }

    async fn ingest_range(
        &self,
        config: &IngestionConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        newer_than: Option<DateTime<Utc>>,
        limits: &OperationLimits,
        result: &mut IngestionResult,
    ) -> Result<RangeTally, BrokerError> {
        let raws = self.fetch_bounded(config, start, end, limits).await?;
        result.total_fetched += raws.len() as u64;

        let mut tally = RangeTally::default();

        for raw in &raws {
            let candle = match validator::normalize(&config.pair, config.timeframe, raw) {
                Ok(c) => c,
                Err(e) => {
                    debug!(pair = %config.pair, field = e.field(), error = %e, "candle rejected");
                    result.total_skipped += 1;
                    continue;
                }
            };

            if candle.timestamp < start || candle.timestamp >= end {
                result.total_skipped += 1;
                continue;
            }

            if let Err(e) = validator::validate(&candle) {
                debug!(pair = %config.pair, ts = %candle.timestamp, error = %e, "candle rejected");
                result.total_skipped += 1;
                continue;
            }

            if newer_than.map_or(true, |ts| candle.timestamp > ts)
                && tally.first_newer.map_or(true, |ts| candle.timestamp < ts)
            {
                tally.first_newer = Some(candle.timestamp);
            }

            if config.enable_session_filtering
                && !self.session_filter.is_within_trading_hours(candle.timestamp)
            {
                result.total_filtered += 1;
                continue;
            }

            let outcome = self
                .repository
                .insert_candle(&candle)
                .await
                .map_err(|e| BrokerError::Storage(format!("{e:#}")))?;

            match outcome {
                InsertOutcome::Inserted => result.total_inserted += 1,
                InsertOutcome::Duplicate => result.total_skipped += 1,
            }
        }

        Ok(tally)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{bar, raw, MockBroker, MockStep};
    use crate::market_data::candle_store::{CandleKey, MemoryCandleStore};
    use crate::market_data::session::{SessionConfig, SessionFilter};
    use crate::types::Candle;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, DurationRound, TimeZone};

    struct AllHours;

    impl TradingSessionFilter for AllHours {
        fn is_within_trading_hours(&self, _ts: DateTime<Utc>) -> bool {
            true
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CandleRepository for BrokenStore {
        async fn insert_candle(&self, _candle: &Candle) -> anyhow::Result<InsertOutcome> {
            Err(anyhow!("disk full"))
        }

        async fn get_latest_timestamp(
            &self,
            _pair: &str,
            _timeframe: Timeframe,
        ) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn limits() -> OperationLimits {
        OperationLimits::new(Duration::from_secs(5), CancellationToken::new())
    }

    fn service(broker: Arc<MockBroker>, store: Arc<MemoryCandleStore>) -> CandleIngestionService {
        CandleIngestionService::new(broker, store, Arc::new(AllHours))
    }

    fn m1(pair: &str) -> IngestionConfig {
        IngestionConfig::new("MOCK", pair, Timeframe::M1)
    }

    #[test]
    fn recommended_tables_grow_with_timeframe() {
        let mut prev = chrono::Duration::zero();
        for tf in Timeframe::ALL {
            let span = recommended_backfill_batch(tf);
            assert!(span > prev, "{tf} span should exceed the previous timeframe's");
            prev = span;
        }
        assert_eq!(recommended_backfill_batch(Timeframe::M1), chrono::Duration::days(3));
        assert_eq!(recommended_incremental_lookback(Timeframe::H1), chrono::Duration::hours(168));
    }

    #[tokio::test]
    async fn invalid_candles_are_skipped_without_aborting() {
        let ts = |m| t0() + ChronoDuration::minutes(m);
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Candles(vec![
            raw(ts(0), bar(1.1, 1.2, 1.0, 1.15)),
            // high below close
            raw(ts(1), bar(1.1, 1.12, 1.0, 1.15)),
            RawCandle {
                timestamp: None,
                ..raw(ts(2), bar(1.1, 1.2, 1.0, 1.15))
            },
            raw(ts(3), bar(1.1, 1.2, 1.0, 1.15)),
        ])]));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker, store.clone());

        let result = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), ts(10), 3, &limits())
            .await
            .unwrap();

        assert_eq!(result.total_fetched, 4);
        assert_eq!(result.total_inserted, 2);
        assert_eq!(result.total_skipped, 2);
        assert!(result.errors.is_empty());
        assert!(result.new_candles_found);
        assert_eq!(store.count(&CandleKey::new("EURUSD", Timeframe::M1)), 2);
    }

    #[tokio::test]
    async fn duplicates_are_inserted_once_then_skipped() {
        let broker = Arc::new(MockBroker::new("MOCK"));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker, store.clone());
        let to = t0() + ChronoDuration::minutes(30);

        let first = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), to, 3, &limits())
            .await
            .unwrap();
        let second = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), to, 3, &limits())
            .await
            .unwrap();

        assert_eq!(first.total_inserted, 30);
        assert_eq!(second.total_inserted, 0);
        assert_eq!(second.total_skipped, 30);
        assert!(!second.new_candles_found);
        assert_eq!(store.total_count(), 30);
    }

    #[tokio::test]
    async fn candles_outside_the_sub_range_are_discarded() {
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Candles(vec![
            raw(t0() - ChronoDuration::minutes(1), bar(1.1, 1.2, 1.0, 1.15)),
            raw(t0(), bar(1.1, 1.2, 1.0, 1.15)),
            raw(t0() + ChronoDuration::minutes(5), bar(1.1, 1.2, 1.0, 1.15)),
        ])]));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker, store);

        let result = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::minutes(5), 3, &limits())
            .await
            .unwrap();
        assert_eq!(result.total_inserted, 1);
        assert_eq!(result.total_skipped, 2);
    }

    #[tokio::test]
    async fn backfill_splits_into_recommended_sub_ranges() {
        let broker = Arc::new(MockBroker::new("MOCK"));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker.clone(), store);

        // 7 days of M1 → 3 + 3 + 1 days.
        svc.backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::days(7), 3, &limits())
            .await
            .unwrap();

        let calls = broker.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].from, t0());
        assert_eq!(calls[0].to, t0() + ChronoDuration::days(3));
        assert_eq!(calls[2].to, t0() + ChronoDuration::days(7));
    }

    #[tokio::test]
    async fn failed_sub_range_is_recorded_and_siblings_continue() {
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![
            MockStep::Generate,
            MockStep::Fail(BrokerError::Connection {
                broker: "MOCK".into(),
                message: "reset".into(),
            }),
            MockStep::Generate,
        ]));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker.clone(), store);
        let cfg = IngestionConfig::new("MOCK", "EURUSD", Timeframe::D1);
        let to = t0() + ChronoDuration::days(1825 * 2 + 10);

        let result = svc.backfill_historical_data(&cfg, t0(), to, 3, &limits()).await.unwrap();

        assert_eq!(broker.call_count(), 3);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].from, t0() + ChronoDuration::days(1825));
        assert!(result.errors[0].error.contains("reset"));
        assert_eq!(result.total_inserted, 1825 + 10);
    }

    #[tokio::test]
    async fn every_sub_range_failing_propagates_the_last_error() {
        let broker = Arc::new(MockBroker::new("MOCK").with_fallback(MockStep::Fail(
            BrokerError::Connection {
                broker: "MOCK".into(),
                message: "down".into(),
            },
        )));
        let svc = service(broker, Arc::new(MemoryCandleStore::new()));

        let err = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::days(5), 3, &limits())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection { .. }));
    }

    #[tokio::test]
    async fn job_fatal_errors_stop_the_run() {
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Fail(
            BrokerError::Authentication {
                broker: "MOCK".into(),
                message: "bad token".into(),
            },
        )]));
        let svc = service(broker.clone(), Arc::new(MemoryCandleStore::new()));

        let err = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::days(9), 3, &limits())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authentication { .. }));
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_range_is_an_invalid_request() {
        let svc = service(Arc::new(MockBroker::new("MOCK")), Arc::new(MemoryCandleStore::new()));
        let err = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0(), 3, &limits())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn session_filter_drops_out_of_hours_candles() {
        let broker = Arc::new(MockBroker::new("MOCK"));
        let store = Arc::new(MemoryCandleStore::new());
        let filter = SessionFilter::from_config(&SessionConfig::default()).unwrap();
        let svc = CandleIngestionService::new(broker, store.clone(), Arc::new(filter));
        let cfg = IngestionConfig::new("MOCK", "EURUSD", Timeframe::H1).with_session_filtering(true);

        // Wednesday 2024-01-03, full day: london 07-16 ∪ new_york 12-21 → 07..21.
        let day = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let result = svc
            .backfill_historical_data(&cfg, day, day + ChronoDuration::days(1), 3, &limits())
            .await
            .unwrap();

        assert_eq!(result.total_fetched, 24);
        assert_eq!(result.total_inserted, 14);
        assert_eq!(result.total_filtered, 10);
        assert_eq!(result.total_skipped, 0);
    }

    #[tokio::test]
    async fn storage_failure_fails_the_sub_range() {
        let broker = Arc::new(MockBroker::new("MOCK"));
        let svc = CandleIngestionService::new(broker, Arc::new(BrokenStore), Arc::new(AllHours));

        let err = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::hours(1), 3, &limits())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Storage(ref m) if m.contains("disk full")));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_adapter_call_hits_the_operation_timeout() {
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Hang]));
        let svc = service(broker, Arc::new(MemoryCandleStore::new()));
        let limits = OperationLimits::new(Duration::from_millis(500), CancellationToken::new());

        let err = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::hours(1), 3, &limits)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Timeout {
                scope: TimeoutScope::Operation,
                elapsed_ms: 500
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_an_in_flight_call() {
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Hang]));
        let svc = service(broker, Arc::new(MemoryCandleStore::new()));
        let limits = OperationLimits::new(Duration::from_secs(60), CancellationToken::new());

        let token = limits.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let err = svc
            .backfill_historical_data(&m1("EURUSD"), t0(), t0() + ChronoDuration::hours(1), 3, &limits)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled));
    }

    #[tokio::test]
    async fn incremental_on_empty_store_uses_lookback() {
        let broker = Arc::new(MockBroker::new("MOCK"));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker.clone(), store);

        let result = svc.smart_incremental_update(&m1("EURUSD"), 1, &limits()).await.unwrap();

        let calls = broker.calls();
        let call = &calls[0];
        let span = call.to - call.from;
        assert_eq!(span, recommended_incremental_lookback(Timeframe::M1));
        assert!(result.new_candles_found);
        assert!(!result.gap_detected);
    }

    #[tokio::test]
    async fn incremental_resumes_from_latest_and_flags_gap() {
        let now = Utc::now().duration_trunc(ChronoDuration::minutes(1)).unwrap();
        let last = now - ChronoDuration::minutes(30);
        let store = Arc::new(MemoryCandleStore::new());
        store.insert(&validator::normalize("EURUSD", Timeframe::M1, &raw(last, bar(1.1, 1.2, 1.0, 1.15))).unwrap());

        // Upstream only has candles from 10 minutes after the stored one.
        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Candles(vec![
            raw(last, bar(1.1, 1.2, 1.0, 1.15)),
            raw(last + ChronoDuration::minutes(10), bar(1.1, 1.2, 1.0, 1.15)),
            raw(last + ChronoDuration::minutes(11), bar(1.1, 1.2, 1.0, 1.15)),
        ])]));
        let svc = service(broker.clone(), store);

        let result = svc.smart_incremental_update(&m1("EURUSD"), 1, &limits()).await.unwrap();

        assert_eq!(broker.calls()[0].from, last);
        assert!(result.gap_detected);
        assert!(result.new_candles_found);
        assert_eq!(result.total_inserted, 2);
        assert_eq!(result.total_skipped, 1);
    }

    #[tokio::test]
    async fn incremental_resumes_for_separator_spelled_pairs() {
        let now = Utc::now().duration_trunc(ChronoDuration::minutes(1)).unwrap();
        let last = now - ChronoDuration::minutes(20);
        let broker = Arc::new(MockBroker::new("MOCK"));
        let store = Arc::new(MemoryCandleStore::new());
        let svc = service(broker.clone(), store.clone());
        let cfg = m1("eur/usd");

        svc.backfill_historical_data(&cfg, last, last + ChronoDuration::minutes(1), 3, &limits())
            .await
            .unwrap();
        assert_eq!(store.latest_timestamp(&CandleKey::new("EURUSD", Timeframe::M1)), Some(last));

        let result = svc.smart_incremental_update(&cfg, 1, &limits()).await.unwrap();

        let calls = broker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].from, last);
        assert!(!result.gap_detected);
        assert!(result.total_inserted >= 19);
        assert!(result.total_skipped >= 1);
    }

    #[tokio::test]
    async fn incremental_without_new_candles() {
        let now = Utc::now().duration_trunc(ChronoDuration::minutes(1)).unwrap();
        let last = now - ChronoDuration::minutes(2);
        let store = Arc::new(MemoryCandleStore::new());
        store.insert(&validator::normalize("EURUSD", Timeframe::M1, &raw(last, bar(1.1, 1.2, 1.0, 1.15))).unwrap());

        let broker = Arc::new(MockBroker::new("MOCK").with_steps(vec![MockStep::Candles(vec![
            raw(last, bar(1.1, 1.2, 1.0, 1.15)),
            raw(last + ChronoDuration::minutes(1), bar(1.1, 1.2, 1.0, 1.15)),
        ])]));
        let svc = service(broker, store);

        let result = svc.smart_incremental_update(&m1("EURUSD"), 1, &limits()).await.unwrap();
        assert!(!result.gap_detected);
        assert_eq!(result.total_inserted, 1);
    }
}
