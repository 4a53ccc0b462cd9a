// =============================================================================
// HTTP plumbing shared by the REST adapters
// =============================================================================
//
// Status mapping:
//   401            -> Authentication
//   429            -> RateLimit (Retry-After honoured when present)
//   5xx, transport -> Connection
//   other non-2xx  -> Adapter (carries the upstream message)
// =============================================================================

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::errors::BrokerError;

/// Longest upstream message carried into an error.
const MAX_MESSAGE_LEN: usize = 200;

/// Buffered response: status, headers and the full body text.
#[derive(Debug)]
pub struct HttpReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpReply {
    /// Map a non-2xx reply to the adapter error taxonomy.
    pub fn error_for_status(&self, broker: &str) -> Option<BrokerError> {
        classify_status(broker, self.status, &self.headers, &self.body)
    }
}

/// Send `request` and buffer the reply. The in-flight request is dropped (and
/// the connection abandoned) as soon as `cancel` fires.
pub async fn send(
    broker: &str,
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<HttpReply, BrokerError> {
    let exchange = async {
        let resp = request
            .send()
            .await
            .map_err(|e| transport_error(broker, &e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(|e| transport_error(broker, &e))?;
        Ok(HttpReply {
            status,
            headers,
            body,
        })
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(BrokerError::Cancelled),
        reply = exchange => reply,
    }
}

pub fn classify_status(
    broker: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> Option<BrokerError> {
    if status.is_success() {
        return None;
    }

    let err = match status {
        StatusCode::UNAUTHORIZED => BrokerError::Authentication {
            broker: broker.to_string(),
            message: upstream_message(body),
        },
        StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimit {
            broker: broker.to_string(),
            retry_after: parse_retry_after(headers),
        },
        s if s.is_server_error() => BrokerError::Connection {
            broker: broker.to_string(),
            message: format!("HTTP {}: {}", s.as_u16(), upstream_message(body)),
        },
        s => BrokerError::Adapter {
            broker: broker.to_string(),
            status: Some(s.as_u16()),
            message: upstream_message(body),
        },
    };
    Some(err)
}

pub fn transport_error(broker: &str, err: &reqwest::Error) -> BrokerError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    BrokerError::Connection {
        broker: broker.to_string(),
        message,
    }
}

/// `Retry-After` in seconds (integer or fractional).
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Pull a human-readable message out of an error body. OANDA uses
/// `errorMessage`, Binance uses `msg`; anything else is passed through.
fn upstream_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["errorMessage", "msg", "message"] {
            if let Some(msg) = json.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    trimmed.chars().take(MAX_MESSAGE_LEN).collect()
}
