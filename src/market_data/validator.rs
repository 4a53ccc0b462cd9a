// =============================================================================
// Candle Validator — normalisation and OHLCV invariants
// =============================================================================
//
// Pure functions. A failure names the offending field; callers drop the record,
// count it as skipped and carry on with the rest of the batch.
// =============================================================================

use crate::errors::ValidationError;
use crate::types::{canonical_pair, Candle, PriceBar, RawCandle, Timeframe};

/// Turn a provider record into a canonical candle.
///
/// Price resolution order: bid/ask midpoint when both sides are present,
/// otherwise the provider's single price series. A missing volume reads as 0.
pub fn normalize(pair: &str, timeframe: Timeframe, raw: &RawCandle) -> Result<Candle, ValidationError> {
    let timestamp = raw
        .timestamp
        .ok_or(ValidationError::MissingField("timestamp"))?;

    let price = resolve_price(raw).ok_or(ValidationError::MissingField("price"))?;

    let pair = canonical_pair(pair);
    if pair.is_empty() {
        return Err(ValidationError::MissingField("pair"));
    }

    Ok(Candle {
        pair,
        timeframe,
        timestamp,
        open: price.open,
        high: price.high,
        low: price.low,
        close: price.close,
        volume: raw.volume.unwrap_or(0.0),
    })
}

fn resolve_price(raw: &RawCandle) -> Option<PriceBar> {
    match (&raw.bid, &raw.ask) {
        (Some(bid), Some(ask)) => Some(bid.midpoint(ask)),
        _ => raw.mid,
    }
}

/// Check the OHLCV invariants of a normalised candle.
pub fn validate(candle: &Candle) -> Result<(), ValidationError> {
    for (field, value) in [
        ("open", candle.open),
        ("high", candle.high),
        ("low", candle.low),
        ("close", candle.close),
    ] {
        if !value.is_finite() {
            return Err(invalid(field, format!("{value} is not finite")));
        }
        if value <= 0.0 {
            return Err(invalid(field, format!("{value} must be positive")));
        }
    }

    let body_top = candle.open.max(candle.close);
    let body_bottom = candle.open.min(candle.close);

    if candle.high < body_top {
        return Err(invalid(
            "high",
            format!("{} below max(open, close) {}", candle.high, body_top),
        ));
    }
    if candle.low > body_bottom {
        return Err(invalid(
            "low",
            format!("{} above min(open, close) {}", candle.low, body_bottom),
        ));
    }

    if !candle.volume.is_finite() || candle.volume < 0.0 {
        return Err(invalid("volume", format!("{} must be >= 0", candle.volume)));
    }

    Ok(())
}

fn invalid(field: &'static str, reason: String) -> ValidationError {
    ValidationError::InvalidField { field, reason }
}

// =============================================================================
// Tests
// =============================================================================
