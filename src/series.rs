//! Row types shared by ingestion, the feature engine and the production store,
//! plus timestamp helpers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const HOUR_MS: i64 = 3_600_000;

/// One ground-truth observation of the forecast target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub ts_ms_utc: i64,
    pub value: f64,
    /// Exogenous values, ordered like the configured exogenous columns.
    pub exogenous: Vec<f64>,
}

impl Observation {
    pub fn new(ts_ms_utc: i64, value: f64) -> Self {
        Self {
            ts_ms_utc,
            value,
            exogenous: Vec::new(),
        }
    }

    pub fn with_exogenous(ts_ms_utc: i64, value: f64, exogenous: Vec<f64>) -> Self {
        Self {
            ts_ms_utc,
            value,
            exogenous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub ts_ms_utc: i64,
    pub predicted_value: f64,
    /// Content hash of the model artifact that produced the value.
    pub model_fingerprint: String,
}

pub fn format_ts(ts_ms_utc: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms_utc).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => format!("invalid({ts_ms_utc})"),
    }
}

/// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or a bare date.
/// Offset-less inputs are read as UTC.
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Parses durations like `1h`, `30m`, `15s`, `1d`, `500ms`.
pub fn parse_duration_ms(raw: &str) -> Option<i64> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: i64 = digits.parse().ok()?;
    let unit_ms = match unit.trim() {
        "ms" => 1,
        "s" | "sec" | "secs" => 1_000,
        "m" | "min" | "mins" => 60_000,
        "h" | "hr" | "hour" | "hours" => HOUR_MS,
        "d" | "day" | "days" => 24 * HOUR_MS,
        _ => return None,
    };
    amount.checked_mul(unit_ms).filter(|ms| *ms > 0)
}

/// True when `ts_ms_utc` sits on the sampling grid of `step_ms`.
pub fn is_on_grid(ts_ms_utc: i64, step_ms: i64) -> bool {
    step_ms > 0 && ts_ms_utc.rem_euclid(step_ms) == 0
}
