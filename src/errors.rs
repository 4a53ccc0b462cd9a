// =============================================================================
// Error taxonomy — adapter, validation and submission errors
// =============================================================================
//
// Every adapter failure is a `BrokerError`. The coordinator never inspects
// messages; it asks `retry_class()` what to do with the job.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// A single upstream call. Non-fatal to the job.
    Operation,
    /// The job's total wall-clock budget. Fatal to the job.
    Job,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operation => write!(f, "operation"),
            Self::Job => write!(f, "job"),
        }
    }
}

/// A single record failed normalisation or an OHLCV invariant.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingField(field) => field,
            Self::InvalidField { field, .. } => field,
        }
    }
}

/// Failures surfaced by broker adapters and the ingestion service.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Transport failure, upstream timeout or 5xx.
    #[error("connection error ({broker}): {message}")]
    Connection { broker: String, message: String },

    /// Credentials rejected (HTTP 401). Needs an operator fix.
    #[error("authentication failed ({broker}): {message}")]
    Authentication { broker: String, message: String },

    /// Upstream asked us to slow down.
    #[error("rate limited by {broker} (retry after {retry_after:?})")]
    RateLimit {
        broker: String,
        retry_after: Option<Duration>,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{scope} timeout after {elapsed_ms} ms")]
    Timeout { scope: TimeoutScope, elapsed_ms: u64 },

    #[error("{broker} does not support pair {pair}")]
    UnsupportedPair { broker: String, pair: String },

    #[error("{broker} does not support timeframe {timeframe}")]
    UnsupportedTimeframe { broker: String, timeframe: String },

    /// The request itself is malformed (e.g. empty date range).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Repository read or write failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unclassified upstream failure.
    #[error("{broker} returned {status:?}: {message}")]
    Adapter {
        broker: String,
        status: Option<u16>,
        message: String,
    },

    /// The job's cancellation token fired while the call was in flight.
    #[error("operation cancelled")]
    Cancelled,
}

/// What the scheduler should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Fail the job now.
    Never,
    /// Retry up to the configured limit with exponential backoff.
    WithBackoff,
    /// Unclassified failure: retry at most once.
    Limited,
    /// Return the job to the queue until the delay elapses. Not a failure.
    Backpressure,
}

impl BrokerError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Connection { .. } | Self::Storage(_) => RetryClass::WithBackoff,
            Self::Timeout {
                scope: TimeoutScope::Operation,
                ..
            } => RetryClass::WithBackoff,
            Self::RateLimit { .. } => RetryClass::Backpressure,
            Self::Adapter { .. } => RetryClass::Limited,
            Self::Authentication { .. }
            | Self::Validation(_)
            | Self::Timeout {
                scope: TimeoutScope::Job,
                ..
            }
            | Self::UnsupportedPair { .. }
            | Self::UnsupportedTimeframe { .. }
            | Self::InvalidRequest(_)
            | Self::Cancelled => RetryClass::Never,
        }
    }

    /// Errors that end the current ingestion run instead of being recorded
    /// against a single sub-range.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::RateLimit { .. }
                | Self::UnsupportedPair { .. }
                | Self::UnsupportedTimeframe { .. }
                | Self::InvalidRequest(_)
                | Self::Cancelled
        )
    }

    /// Delay requested by the upstream, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Synchronous rejection of a job submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("no broker registered under '{0}'")]
    UnknownBroker(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),
}
