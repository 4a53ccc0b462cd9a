//! Scripted adapter used by the service and coordinator tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::BrokerAdapter;
use crate::errors::BrokerError;
use crate::types::{PriceBar, RawCandle, Timeframe};

/// Behaviour of one `fetch_candles` call.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Valid candles on every timeframe boundary of the requested range.
    Generate,
    Candles(Vec<RawCandle>),
    Fail(BrokerError),
    /// Never answers; only cancellation ends the call.
    Hang,
    /// Sleep, then behave as the wrapped step.
    Delay(Duration, Box<MockStep>),
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub pair: String,
    pub timeframe: Timeframe,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub struct MockBroker {
    name: String,
    steps: Mutex<VecDeque<MockStep>>,
    fallback: MockStep,
    calls: Mutex<Vec<MockCall>>,
}

impl MockBroker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(VecDeque::new()),
            fallback: MockStep::Generate,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Steps consumed one per call, in order.
    pub fn with_steps(self, steps: Vec<MockStep>) -> Self {
        *self.steps.lock() = steps.into();
        self
    }

    /// Behaviour once the scripted steps are exhausted.
    pub fn with_fallback(mut self, step: MockStep) -> Self {
        self.fallback = step;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

pub fn bar(open: f64, high: f64, low: f64, close: f64) -> PriceBar {
    PriceBar {
        open,
        high,
        low,
        close,
    }
}

pub fn raw(timestamp: DateTime<Utc>, price: PriceBar) -> RawCandle {
    RawCandle {
        timestamp: Some(timestamp),
        bid: None,
        ask: None,
        mid: Some(price),
        volume: Some(100.0),
    }
}

/// One well-formed candle per timeframe step in `[from, to)`.
pub fn generate_candles(timeframe: Timeframe, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<RawCandle> {
    let mut out = Vec::new();
    let mut ts = from;
    let mut i = 0.0;
    while ts < to {
        let p = 1.1 + i * 0.0001;
        out.push(raw(ts, bar(p, p + 0.001, p - 0.001, p + 0.0005)));
        ts += timeframe.duration();
        i += 1.0;
    }
    out
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    fn broker_name(&self) -> &str {
        &self.name
    }

    async fn validate_connection(&self) -> bool {
        true
    }

    async fn fetch_candles(
        &self,
        pair: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandle>, BrokerError> {
        self.calls.lock().push(MockCall {
            pair: pair.to_string(),
            timeframe,
            from,
            to,
        });

        let mut step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        loop {
            match step {
                MockStep::Generate => return Ok(generate_candles(timeframe, from, to)),
                MockStep::Candles(candles) => return Ok(candles),
                MockStep::Fail(err) => return Err(err),
                MockStep::Hang => {
                    cancel.cancelled().await;
                    return Err(BrokerError::Cancelled);
                }
                MockStep::Delay(delay, next) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    step = *next;
                }
            }
        }
    }
}
