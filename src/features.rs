//! Observations-to-features transform shared by training and inference.
//!
//! Training calls [`build_features`] over a full history and gets one labelled
//! row per observation that has a complete lag history. Inference calls
//! [`build_features_at`] with the window that precedes a held-out timestamp and
//! gets exactly one unlabelled row. Both paths derive values through the same
//! routine, and a row for `T` only ever reads observations strictly before `T`.

use std::collections::{HashSet, VecDeque};
use std::f64::consts::PI;

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::series::{format_ts, is_on_grid, Observation, HOUR_MS};

const WEEK_SECONDS: f64 = 7.0 * 24.0 * 60.0 * 60.0;
const MAX_REPORTED_GAP_RANGES: usize = 256;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    Strict,
    ReportAndSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarField {
    Hour,
    DayOfWeek,
    DayOfMonth,
    Month,
    Year,
    DayOfYear,
    IsWeekend,
    TowSin,
    TowCos,
}

impl CalendarField {
    pub fn column_name(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::DayOfWeek => "day_of_week",
            Self::DayOfMonth => "day_of_month",
            Self::Month => "month",
            Self::Year => "year",
            Self::DayOfYear => "day_of_year",
            Self::IsWeekend => "is_weekend",
            Self::TowSin => "tow_sin",
            Self::TowCos => "tow_cos",
        }
    }

    fn value<Z: TimeZone>(self, dt: &DateTime<Z>) -> f64 {
        match self {
            Self::Hour => dt.hour() as f64,
            Self::DayOfWeek => dt.weekday().num_days_from_monday() as f64,
            Self::DayOfMonth => dt.day() as f64,
            Self::Month => dt.month() as f64,
            Self::Year => dt.year() as f64,
            Self::DayOfYear => dt.ordinal() as f64,
            Self::IsWeekend => {
                if dt.weekday().num_days_from_monday() >= 5 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::TowSin => time_of_week_angle(dt).sin(),
            Self::TowCos => time_of_week_angle(dt).cos(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ts_ms_utc: i64,
    pub values: Vec<f64>,
    /// Observed target at `ts_ms_utc`; `None` for held-out inference rows.
    pub label: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTransformReport {
    pub input_points: u64,
    pub output_points: u64,
    pub warmup_points: u64,
    pub skipped_points: u64,
    pub gap_ranges: Vec<(i64, i64)>,
    pub first_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTransformConfig {
    /// Lag offsets in sampling intervals, in column order.
    pub lags: Vec<u32>,
    pub calendar_fields: Vec<CalendarField>,
    /// Exogenous columns, each contributed as its value one interval back.
    pub exogenous_columns: Vec<String>,
    pub step_ms: i64,
    /// IANA zone the calendar fields are evaluated in.
    pub timezone: String,
    pub gap_policy: GapPolicy,
    pub schema_version: u32,
}

impl Default for FeatureTransformConfig {
    fn default() -> Self {
        Self {
            lags: vec![1, 2, 3, 24],
            calendar_fields: vec![
                CalendarField::Hour,
                CalendarField::DayOfWeek,
                CalendarField::Month,
            ],
            exogenous_columns: Vec::new(),
            step_ms: HOUR_MS,
            timezone: "UTC".to_string(),
            gap_policy: GapPolicy::Strict,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureTransformConfig {
    /// Number of preceding observations a row needs.
    pub fn max_lag(&self) -> usize {
        self.lags.iter().copied().max().unwrap_or(1).max(1) as usize
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature transform config: {0}")]
    InvalidConfig(String),
    #[error("timestamp {ts_ms_utc} is not aligned to the {step_ms}ms sampling grid")]
    OffGridTimestamp { ts_ms_utc: i64, step_ms: i64 },
    #[error("duplicate observation at {}", format_ts(*ts_ms_utc))]
    DuplicateTimestamp { ts_ms_utc: i64 },
    #[error(
        "observation at {} arrived after {}; input must be ascending",
        format_ts(*ts_ms_utc),
        format_ts(*previous_ts_ms_utc)
    )]
    OutOfOrder {
        previous_ts_ms_utc: i64,
        ts_ms_utc: i64,
    },
    #[error("non-finite value at {}", format_ts(*ts_ms_utc))]
    NonFiniteValue { ts_ms_utc: i64 },
    #[error("observation at {ts_ms_utc} has {actual} exogenous values, expected {expected}")]
    ExogenousArity {
        ts_ms_utc: i64,
        expected: usize,
        actual: usize,
    },
    #[error(
        "continuity gap detected from {expected_next_ts_ms_utc} to {actual_ts_ms_utc} ({missing_points} missing points)"
    )]
    ContinuityGap {
        expected_next_ts_ms_utc: i64,
        actual_ts_ms_utc: i64,
        missing_points: u64,
    },
    #[error(
        "window ends at {} which is not before target {}",
        format_ts(*last_ts_ms_utc),
        format_ts(*target_ts_ms_utc)
    )]
    WindowNotBeforeTarget {
        last_ts_ms_utc: i64,
        target_ts_ms_utc: i64,
    },
    #[error(
        "insufficient history for {}: need {required} observations, have {available}",
        format_ts(*target_ts_ms_utc)
    )]
    InsufficientHistory {
        target_ts_ms_utc: i64,
        required: usize,
        available: usize,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

impl FeatureError {
    /// Errors caused by the input rows rather than configuration or schema.
    pub fn is_data_quality(&self) -> bool {
        matches!(
            self,
            Self::OffGridTimestamp { .. }
                | Self::DuplicateTimestamp { .. }
                | Self::OutOfOrder { .. }
                | Self::NonFiniteValue { .. }
                | Self::ExogenousArity { .. }
                | Self::ContinuityGap { .. }
                | Self::WindowNotBeforeTarget { .. }
        )
    }
}

pub fn build_feature_schema(cfg: &FeatureTransformConfig) -> FeatureSchema {
    let mut columns = Vec::new();

    for lag in &cfg.lags {
        columns.push(FeatureColumn {
            name: format!("lag_{lag}"),
            dtype: FeatureDType::F64,
        });
    }
    for field in &cfg.calendar_fields {
        columns.push(FeatureColumn {
            name: field.column_name().to_string(),
            dtype: FeatureDType::F64,
        });
    }
    for exogenous in &cfg.exogenous_columns {
        columns.push(FeatureColumn {
            name: format!("{exogenous}_lag_1"),
            dtype: FeatureDType::F64,
        });
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    debug!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        lags = ?cfg.lags,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

/// Builds one labelled row per observation that has `max(lags)` contiguous
/// predecessors. Contiguous input of length `n` yields `n - max(lags)` rows.
pub fn build_features(
    rows: &[Observation],
    cfg: &FeatureTransformConfig,
) -> Result<(FeatureSchema, Vec<FeatureRow>, FeatureTransformReport), FeatureError> {
    validate_config(cfg)?;
    let tz = parse_timezone(&cfg.timezone)?;

    info!(
        component = "features",
        event = "features.transform.start",
        input_points = rows.len(),
        lags = ?cfg.lags,
        gap_policy = ?cfg.gap_policy
    );

    let schema = build_feature_schema(cfg);
    let max_lag = cfg.max_lag();
    let mut report = FeatureTransformReport {
        input_points: rows.len() as u64,
        output_points: 0,
        warmup_points: 0,
        skipped_points: 0,
        gap_ranges: Vec::new(),
        first_error: None,
    };

    let mut history: VecDeque<&Observation> = VecDeque::with_capacity(max_lag + 1);
    let mut previous_ts: Option<i64> = None;
    let mut output_rows = Vec::new();

    for row in rows {
        check_row(row, cfg)?;

        if let Some(prev) = previous_ts {
            check_ordering(prev, row.ts_ms_utc)?;
            let expected = prev + cfg.step_ms;
            if row.ts_ms_utc != expected {
                handle_gap(expected, row.ts_ms_utc, cfg, &mut report)?;
                history.clear();
            }
        }
        previous_ts = Some(row.ts_ms_utc);

        if history.len() >= max_lag {
            let values = feature_values(&history, row.ts_ms_utc, cfg, &tz);
            output_rows.push(FeatureRow {
                ts_ms_utc: row.ts_ms_utc,
                values,
                label: Some(row.value),
            });
        } else {
            report.warmup_points += 1;
        }

        history.push_back(row);
        while history.len() > max_lag {
            history.pop_front();
        }
    }

    report.output_points = output_rows.len() as u64;

    info!(
        component = "features",
        event = "features.transform.finish",
        input_points = report.input_points,
        output_points = report.output_points,
        warmup_points = report.warmup_points,
        skipped_points = report.skipped_points,
        gap_ranges_reported = report.gap_ranges.len()
    );

    Ok((schema, output_rows, report))
}

/// Builds the single unlabelled row for `target_ts_ms_utc` from the window of
/// observations immediately preceding it. Gaps are always fatal here.
pub fn build_features_at(
    window: &[Observation],
    target_ts_ms_utc: i64,
    cfg: &FeatureTransformConfig,
) -> Result<(FeatureSchema, FeatureRow), FeatureError> {
    validate_config(cfg)?;
    let tz = parse_timezone(&cfg.timezone)?;
    let max_lag = cfg.max_lag();

    if !is_on_grid(target_ts_ms_utc, cfg.step_ms) {
        return Err(FeatureError::OffGridTimestamp {
            ts_ms_utc: target_ts_ms_utc,
            step_ms: cfg.step_ms,
        });
    }
    if window.len() < max_lag {
        return Err(FeatureError::InsufficientHistory {
            target_ts_ms_utc,
            required: max_lag,
            available: window.len(),
        });
    }

    let mut previous_ts: Option<i64> = None;
    for row in window {
        check_row(row, cfg)?;
        if let Some(prev) = previous_ts {
            check_ordering(prev, row.ts_ms_utc)?;
            let expected = prev + cfg.step_ms;
            if row.ts_ms_utc != expected {
                return Err(continuity_gap(expected, row.ts_ms_utc, cfg.step_ms));
            }
        }
        previous_ts = Some(row.ts_ms_utc);
    }

    // Non-empty: window.len() >= max_lag >= 1.
    let last_ts = window[window.len() - 1].ts_ms_utc;
    if last_ts >= target_ts_ms_utc {
        return Err(FeatureError::WindowNotBeforeTarget {
            last_ts_ms_utc: last_ts,
            target_ts_ms_utc,
        });
    }
    let expected = last_ts + cfg.step_ms;
    if expected != target_ts_ms_utc {
        return Err(continuity_gap(expected, target_ts_ms_utc, cfg.step_ms));
    }

    let history: VecDeque<&Observation> = window[window.len() - max_lag..].iter().collect();
    let row = FeatureRow {
        ts_ms_utc: target_ts_ms_utc,
        values: feature_values(&history, target_ts_ms_utc, cfg, &tz),
        label: None,
    };

    Ok((build_feature_schema(cfg), row))
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub fn validate_config(cfg: &FeatureTransformConfig) -> Result<(), FeatureError> {
    if cfg.step_ms <= 0 {
        return Err(FeatureError::InvalidConfig(
            "step_ms must be > 0".to_string(),
        ));
    }

    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    if cfg.lags.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "lags must contain at least one entry".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for lag in &cfg.lags {
        if *lag == 0 {
            return Err(FeatureError::InvalidConfig(
                "lags entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*lag) {
            return Err(FeatureError::InvalidConfig(
                "lags entries must be unique".to_string(),
            ));
        }
    }

    let mut seen_fields = HashSet::new();
    for field in &cfg.calendar_fields {
        if !seen_fields.insert(*field) {
            return Err(FeatureError::InvalidConfig(format!(
                "calendar field {} listed twice",
                field.column_name()
            )));
        }
    }

    let mut seen_exogenous = HashSet::new();
    for column in &cfg.exogenous_columns {
        if column.trim().is_empty() || !seen_exogenous.insert(column.as_str()) {
            return Err(FeatureError::InvalidConfig(format!(
                "exogenous column '{column}' is empty or duplicated"
            )));
        }
    }

    parse_timezone(&cfg.timezone)?;
    Ok(())
}

fn parse_timezone(raw: &str) -> Result<Tz, FeatureError> {
    raw.parse::<Tz>()
        .map_err(|_| FeatureError::InvalidConfig(format!("unknown timezone '{raw}'")))
}

fn check_row(row: &Observation, cfg: &FeatureTransformConfig) -> Result<(), FeatureError> {
    if !is_on_grid(row.ts_ms_utc, cfg.step_ms) {
        return Err(FeatureError::OffGridTimestamp {
            ts_ms_utc: row.ts_ms_utc,
            step_ms: cfg.step_ms,
        });
    }
    if row.exogenous.len() != cfg.exogenous_columns.len() {
        return Err(FeatureError::ExogenousArity {
            ts_ms_utc: row.ts_ms_utc,
            expected: cfg.exogenous_columns.len(),
            actual: row.exogenous.len(),
        });
    }
    if !row.value.is_finite() || row.exogenous.iter().any(|v| !v.is_finite()) {
        return Err(FeatureError::NonFiniteValue {
            ts_ms_utc: row.ts_ms_utc,
        });
    }
    Ok(())
}

fn check_ordering(previous_ts_ms_utc: i64, ts_ms_utc: i64) -> Result<(), FeatureError> {
    if ts_ms_utc == previous_ts_ms_utc {
        return Err(FeatureError::DuplicateTimestamp { ts_ms_utc });
    }
    if ts_ms_utc < previous_ts_ms_utc {
        return Err(FeatureError::OutOfOrder {
            previous_ts_ms_utc,
            ts_ms_utc,
        });
    }
    Ok(())
}

/// `history` holds the `max_lag` observations ending one interval before `ts_ms_utc`.
fn feature_values(
    history: &VecDeque<&Observation>,
    ts_ms_utc: i64,
    cfg: &FeatureTransformConfig,
    tz: &Tz,
) -> Vec<f64> {
    let len = history.len();
    let mut values = Vec::with_capacity(
        cfg.lags.len() + cfg.calendar_fields.len() + cfg.exogenous_columns.len(),
    );

    for lag in &cfg.lags {
        values.push(history[len - *lag as usize].value);
    }

    let local = tz.timestamp_millis_opt(ts_ms_utc).single();
    for field in &cfg.calendar_fields {
        // Any i64 millisecond instant inside chrono's range maps to one local time.
        values.push(local.as_ref().map(|dt| field.value(dt)).unwrap_or(f64::NAN));
    }

    let previous = history[len - 1];
    for idx in 0..cfg.exogenous_columns.len() {
        values.push(previous.exogenous[idx]);
    }

    values
}

fn time_of_week_angle<Z: TimeZone>(dt: &DateTime<Z>) -> f64 {
    let weekday = dt.weekday().num_days_from_monday() as f64;
    let seconds_of_day = dt.hour() as f64 * 3600.0 + dt.minute() as f64 * 60.0 + dt.second() as f64;
    let seconds_of_week = weekday * 86_400.0 + seconds_of_day;
    2.0 * PI * (seconds_of_week / WEEK_SECONDS)
}

fn continuity_gap(expected_next_ts_ms_utc: i64, actual_ts_ms_utc: i64, step_ms: i64) -> FeatureError {
    FeatureError::ContinuityGap {
        expected_next_ts_ms_utc,
        actual_ts_ms_utc,
        missing_points: expected_points(expected_next_ts_ms_utc, actual_ts_ms_utc, step_ms),
    }
}

fn handle_gap(
    expected_next_ts_ms_utc: i64,
    actual_ts_ms_utc: i64,
    cfg: &FeatureTransformConfig,
    report: &mut FeatureTransformReport,
) -> Result<(), FeatureError> {
    match cfg.gap_policy {
        GapPolicy::Strict => Err(continuity_gap(
            expected_next_ts_ms_utc,
            actual_ts_ms_utc,
            cfg.step_ms,
        )),
        GapPolicy::ReportAndSkip => {
            let missing_points =
                expected_points(expected_next_ts_ms_utc, actual_ts_ms_utc, cfg.step_ms);
            warn!(
                component = "features",
                event = "features.transform.gap_detected",
                expected_next_ts_ms_utc = expected_next_ts_ms_utc,
                actual_ts_ms_utc = actual_ts_ms_utc,
                missing_points = missing_points
            );
            report.skipped_points = report.skipped_points.saturating_add(missing_points);
            if report.gap_ranges.len() < MAX_REPORTED_GAP_RANGES {
                report
                    .gap_ranges
                    .push((expected_next_ts_ms_utc, actual_ts_ms_utc));
            }
            if report.first_error.is_none() {
                report.first_error = Some(format!(
                    "continuity gap from {} to {}",
                    format_ts(expected_next_ts_ms_utc),
                    format_ts(actual_ts_ms_utc)
                ));
            }
            Ok(())
        }
    }
}

fn expected_points(start_ts_ms_utc: i64, end_ts_ms_utc_exclusive: i64, step_ms: i64) -> u64 {
    if end_ts_ms_utc_exclusive <= start_ts_ms_utc || step_ms <= 0 {
        0
    } else {
        ((end_ts_ms_utc_exclusive - start_ts_ms_utc) / step_ms) as u64
    }
}

fn schema_fingerprint(cfg: &FeatureTransformConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("step_ms:{};", cfg.step_ms));
    hasher.update(format!("timezone:{};", cfg.timezone));
    hasher.update("lags:");
    for lag in &cfg.lags {
        hasher.update(format!("{lag},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
