// =============================================================================
// Trading Session Filter — timestamp membership in configured trading windows
// =============================================================================
//
// Windows are expressed in wall-clock time of an IANA timezone so that DST
// shifts move the session with the local market. A window whose end is earlier
// than its start wraps past midnight. The weekday check uses the local date of
// the timestamp being tested.
// =============================================================================

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Capability injected into the ingestion service.
pub trait TradingSessionFilter: Send + Sync {
    fn is_within_trading_hours(&self, ts: DateTime<Utc>) -> bool;
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub name: String,
    /// Inclusive.
    pub start: NaiveTime,
    /// Exclusive. Equal to `start` means the whole day.
    pub end: NaiveTime,
}

impl SessionWindow {
    pub fn new(name: &str, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            name: name.to_string(),
            start,
            end,
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            t >= self.start && t < self.end
        } else if self.start > self.end {
            t >= self.start || t < self.end
        } else {
            true
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn default_windows() -> Vec<SessionWindow> {
    vec![
        SessionWindow::new("london", hm(7, 0), hm(16, 0)),
        SessionWindow::new("new_york", hm(12, 0), hm(21, 0)),
    ]
}

fn default_active_days() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}

/// Serializable session definition, part of the runtime config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// IANA name, e.g. `Europe/London`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// An empty list admits every time of day on active days.
    #[serde(default = "default_windows")]
    pub windows: Vec<SessionWindow>,
    #[serde(default = "default_active_days")]
    pub active_days: Vec<Weekday>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            windows: default_windows(),
            active_days: default_active_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionFilter {
    tz: Tz,
    windows: Vec<SessionWindow>,
    active_days: Vec<Weekday>,
}

impl SessionFilter {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid session timezone '{}': {e}", config.timezone))?;

        Ok(Self {
            tz,
            windows: config.windows.clone(),
            active_days: config.active_days.clone(),
        })
    }

    /// Name of the first window containing `ts`, if any.
    pub fn session_at(&self, ts: DateTime<Utc>) -> Option<&str> {
        let local = ts.with_timezone(&self.tz);
        if !self.active_days.contains(&local.weekday()) {
            return None;
        }
        let t = local.time();
        self.windows
            .iter()
            .find(|w| w.contains(t))
            .map(|w| w.name.as_str())
    }
}

impl TradingSessionFilter for SessionFilter {
    fn is_within_trading_hours(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&self.tz);
        if !self.active_days.contains(&local.weekday()) {
            return false;
        }
        if self.windows.is_empty() {
            return true;
        }
        let t = local.time();
        self.windows.iter().any(|w| w.contains(t))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn default_sessions_cover_london_and_new_york() {
        let filter = SessionFilter::from_config(&SessionConfig::default()).unwrap();
        // 2024-01-03 is a Wednesday.
        assert!(filter.is_within_trading_hours(utc(2024, 1, 3, 7, 0)));
        assert!(filter.is_within_trading_hours(utc(2024, 1, 3, 20, 59)));
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 3, 21, 0)));
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 3, 3, 0)));
        assert_eq!(filter.session_at(utc(2024, 1, 3, 8, 0)), Some("london"));
        assert_eq!(filter.session_at(utc(2024, 1, 3, 17, 0)), Some("new_york"));
    }

    #[test]
    fn weekends_are_excluded() {
        let filter = SessionFilter::from_config(&SessionConfig::default()).unwrap();
        // 2024-01-06 is a Saturday.
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 6, 10, 0)));
    }

    #[test]
    fn window_wrapping_midnight() {
        let config = SessionConfig {
            timezone: "UTC".into(),
            windows: vec![SessionWindow::new("asia", hm(23, 0), hm(8, 0))],
            active_days: default_active_days(),
        };
        let filter = SessionFilter::from_config(&config).unwrap();
        assert!(filter.is_within_trading_hours(utc(2024, 1, 3, 23, 30)));
        assert!(filter.is_within_trading_hours(utc(2024, 1, 3, 2, 0)));
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 3, 8, 0)));
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 3, 12, 0)));
    }

    #[test]
    fn timezone_shifts_with_dst() {
        let config = SessionConfig {
            timezone: "America/New_York".into(),
            windows: vec![SessionWindow::new("cash", hm(9, 30), hm(16, 0))],
            active_days: default_active_days(),
        };
        let filter = SessionFilter::from_config(&config).unwrap();
        // Winter: EST = UTC-5, so 09:30 local is 14:30 UTC.
        assert!(filter.is_within_trading_hours(utc(2024, 1, 3, 14, 30)));
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 3, 13, 45)));
        // Summer: EDT = UTC-4, so 09:30 local is 13:30 UTC.
        assert!(filter.is_within_trading_hours(utc(2024, 7, 3, 13, 45)));
    }

    #[test]
    fn empty_window_list_admits_whole_active_day() {
        let config = SessionConfig {
            windows: Vec::new(),
            ..SessionConfig::default()
        };
        let filter = SessionFilter::from_config(&config).unwrap();
        assert!(filter.is_within_trading_hours(utc(2024, 1, 3, 3, 0)));
        assert!(!filter.is_within_trading_hours(utc(2024, 1, 7, 3, 0)));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let config = SessionConfig {
            timezone: "Mars/Olympus".into(),
            ..SessionConfig::default()
        };
        assert!(SessionFilter::from_config(&config).is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let json = serde_json::to_string(&SessionConfig::default()).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SessionConfig::default());

        let partial: SessionConfig = serde_json::from_str(r#"{"timezone":"Europe/London"}"#).unwrap();
        assert_eq!(partial.windows.len(), 2);
        assert_eq!(partial.active_days.len(), 5);
    }
}
