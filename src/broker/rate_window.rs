// =============================================================================
// Request Window — per-adapter self-throttling
// =============================================================================
//
// Each adapter owns one window: a 60-second period and a request counter.
// Once the counter reaches the per-minute limit, `acquire` sleeps until the
// period has elapsed, then starts a fresh period with the counter at zero.
// Callers wait instead of being rejected; concurrent jobs aimed at the same
// adapter queue up here.
//
// Windows are never shared between adapter instances, so one provider's
// throttling cannot stall work bound for another.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::BrokerError;

/// Length of one throttling period.
pub const REQUEST_WINDOW: Duration = Duration::from_secs(60);

struct WindowState {
    started: Instant,
    count: u32,
}

/// Sliding request counter owned by a single adapter.
pub struct RequestWindow {
    broker: &'static str,
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

/// Serialisable view of the window for logs and statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWindowSnapshot {
    pub broker: String,
    pub limit: u32,
    pub used: u32,
    pub resets_in_ms: u64,
}

impl RequestWindow {
    /// Create a window allowing `requests_per_minute` calls per period.
    pub fn new(broker: &'static str, requests_per_minute: u32) -> Self {
        Self {
            broker,
            limit: requests_per_minute.max(1),
            window: REQUEST_WINDOW,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Reserve one request slot, sleeping out the rest of the period when the
    /// limit has been reached. Returns `Cancelled` if `cancel` fires while
    /// waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        loop {
            let wait = {
                let mut s = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(s.started);

                if elapsed >= self.window {
                    s.started = now;
                    s.count = 0;
                }

                if s.count < self.limit {
                    s.count += 1;
                    debug!(
                        broker = self.broker,
                        used = s.count,
                        limit = self.limit,
                        "request slot acquired"
                    );
                    return Ok(());
                }

                self.window.saturating_sub(elapsed)
            };

            warn!(
                broker = self.broker,
                limit = self.limit,
                wait_ms = wait.as_millis() as u64,
                "request window exhausted — throttling"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn snapshot(&self) -> RequestWindowSnapshot {
        let s = self.state.lock();
        let elapsed = Instant::now().duration_since(s.started);
        let (used, resets_in) = if elapsed >= self.window {
            (0, Duration::ZERO)
        } else {
            (s.count, self.window - elapsed)
        };
        RequestWindowSnapshot {
            broker: self.broker.to_string(),
            limit: self.limit,
            used,
            resets_in_ms: resets_in.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for RequestWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RequestWindow")
            .field("broker", &self.broker)
            .field("limit", &self.limit)
            .field("count", &s.count)
            .finish()
    }
}
