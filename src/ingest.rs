//! Raw historical/production table loading and the fixed cleaning transform
//! that turns raw rows into ascending, gap-free observations.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::FeatureTransformConfig;
use crate::series::{format_ts, is_on_grid, parse_timestamp_ms, Observation};

const MISSING_MARKERS: [&str; 4] = ["na", "nan", "null", "none"];

/// Header plus string cells; `None` marks a missing value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { headers, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }
}

/// Thin I/O seam for loading raw tables.
pub trait RawSource {
    fn load_table(&self, path: &Path) -> Result<RawTable, IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvRawSource {
    pub delimiter: u8,
}

impl Default for CsvRawSource {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl RawSource for CsvRawSource {
    fn load_table(&self, path: &Path) -> Result<RawTable, IngestError> {
        if !path.exists() {
            return Err(IngestError::SourceMissing {
                path: path.to_path_buf(),
            });
        }
        let bytes = fs::read(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(bytes.as_slice());

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = (0..headers.len())
                .map(|idx| normalize_cell(record.get(idx).unwrap_or_default()))
                .collect();
            rows.push(row);
        }

        info!(
            component = "ingest",
            event = "ingest.csv.loaded",
            path = %path.display(),
            columns = headers.len(),
            rows = rows.len()
        );

        Ok(RawTable { headers, rows })
    }
}

/// Raw tables held in memory and keyed by path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRawSource {
    tables: HashMap<PathBuf, RawTable>,
}

impl InMemoryRawSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, table: RawTable) {
        self.tables.insert(path.into(), table);
    }
}

impl RawSource for InMemoryRawSource {
    fn load_table(&self, path: &Path) -> Result<RawTable, IngestError> {
        self.tables
            .get(path)
            .cloned()
            .ok_or_else(|| IngestError::SourceMissing {
                path: path.to_path_buf(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimestampSource {
    /// A single column holding a full timestamp.
    Column { column: String },
    /// A calendar date column plus an hour-of-day column.
    DateHour {
        date_column: String,
        hour_column: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTargetPolicy {
    DropRow,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingExogenousPolicy {
    ForwardFill,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapFillPolicy {
    Reject,
    /// Insert the missing intervals as copies of the last observed row.
    ForwardFill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Raw column name to canonical name.
    pub rename: BTreeMap<String, String>,
    /// Dropped after renaming.
    pub drop_columns: Vec<String>,
    pub timestamp: TimestampSource,
    pub target_column: String,
    pub missing_target: MissingTargetPolicy,
    pub missing_exogenous: MissingExogenousPolicy,
    pub gap_fill: GapFillPolicy,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            rename: BTreeMap::new(),
            drop_columns: Vec::new(),
            timestamp: TimestampSource::Column {
                column: "timestamp".to_string(),
            },
            target_column: "value".to_string(),
            missing_target: MissingTargetPolicy::DropRow,
            missing_exogenous: MissingExogenousPolicy::ForwardFill,
            gap_fill: GapFillPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CleaningReport {
    pub input_rows: u64,
    pub output_rows: u64,
    pub dropped_missing_target: u64,
    pub forward_filled_cells: u64,
    pub filled_gap_points: u64,
    pub dropped_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedData {
    pub observations: Vec<Observation>,
    pub report: CleaningReport,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("raw source not found at {path}")]
    SourceMissing { path: PathBuf },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid cleaning config: {0}")]
    InvalidConfig(String),
    #[error("required column '{0}' missing from raw table")]
    MissingColumn(String),
    #[error("row {row}: cannot parse timestamp '{value}'")]
    ParseTimestamp { row: usize, value: String },
    #[error("row {row}: local time '{value}' does not exist in the configured timezone")]
    NonexistentLocalTime { row: usize, value: String },
    #[error("row {row}: cannot parse column {column} value '{value}'")]
    ParseNumber {
        row: usize,
        column: String,
        value: String,
    },
    #[error("row {row}: target value missing")]
    MissingTarget { row: usize },
    #[error("row {row}: exogenous column {column} missing with no earlier value to carry")]
    MissingExogenous { row: usize, column: String },
    #[error("timestamp {ts_ms_utc} is not aligned to the {step_ms}ms sampling grid")]
    OffGridTimestamp { ts_ms_utc: i64, step_ms: i64 },
    #[error("duplicate timestamp {}", format_ts(*ts_ms_utc))]
    DuplicateTimestamp { ts_ms_utc: i64 },
    #[error(
        "continuity gap from {} to {} ({missing_points} missing points)",
        format_ts(*expected_next_ts_ms_utc),
        format_ts(*actual_ts_ms_utc)
    )]
    ContinuityGap {
        expected_next_ts_ms_utc: i64,
        actual_ts_ms_utc: i64,
        missing_points: u64,
    },
}

/// Applies rename, drop, timestamp construction, missing-value policy, ordering
/// and gap policy. Exogenous columns, sampling interval and timezone come from
/// the feature configuration so both stay in lockstep.
pub fn clean_raw_table(
    table: &RawTable,
    cfg: &CleaningConfig,
    features: &FeatureTransformConfig,
) -> Result<CleanedData, IngestError> {
    let tz: Tz = features
        .timezone
        .parse()
        .map_err(|_| IngestError::InvalidConfig(format!("unknown timezone '{}'", features.timezone)))?;
    if features.step_ms <= 0 {
        return Err(IngestError::InvalidConfig("step_ms must be > 0".to_string()));
    }

    let headers: Vec<String> = table
        .headers
        .iter()
        .map(|header| cfg.rename.get(header).cloned().unwrap_or_else(|| header.clone()))
        .collect();

    let mut report = CleaningReport {
        input_rows: table.rows.len() as u64,
        ..CleaningReport::default()
    };
    for column in &cfg.drop_columns {
        if headers.contains(column) {
            report.dropped_columns.push(column.clone());
        } else {
            warn!(
                component = "ingest",
                event = "ingest.clean.drop_missing_column",
                column = column.as_str()
            );
        }
    }
    let dropped = |name: &str| cfg.drop_columns.iter().any(|column| column == name);
    let find = |name: &str| -> Result<usize, IngestError> {
        headers
            .iter()
            .position(|header| header == name && !dropped(header))
            .ok_or_else(|| IngestError::MissingColumn(name.to_string()))
    };

    let target_idx = find(cfg.target_column.as_str())?;
    let exogenous_idx = features
        .exogenous_columns
        .iter()
        .map(|column| find(column.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let ts_columns = match &cfg.timestamp {
        TimestampSource::Column { column } => (find(column.as_str())?, None),
        TimestampSource::DateHour {
            date_column,
            hour_column,
        } => (
            find(date_column.as_str())?,
            Some(find(hour_column.as_str())?),
        ),
    };

    let mut observations = Vec::with_capacity(table.rows.len());
    let mut last_exogenous: Vec<Option<f64>> = vec![None; exogenous_idx.len()];

    for (row_idx, row) in table.rows.iter().enumerate() {
        let cell = move |idx: usize| row.get(idx).and_then(|value| value.as_deref());
        let ts_ms_utc = row_timestamp(row_idx, cell(ts_columns.0), ts_columns.1.and_then(cell), &tz)?;

        let value = match cell(target_idx) {
            Some(raw) => parse_number(row_idx, &cfg.target_column, raw)?,
            None => match cfg.missing_target {
                MissingTargetPolicy::DropRow => {
                    report.dropped_missing_target += 1;
                    continue;
                }
                MissingTargetPolicy::Fail => {
                    return Err(IngestError::MissingTarget { row: row_idx });
                }
            },
        };

        let mut exogenous = Vec::with_capacity(exogenous_idx.len());
        for (slot, (column, idx)) in features
            .exogenous_columns
            .iter()
            .zip(exogenous_idx.iter())
            .enumerate()
        {
            let parsed = match cell(*idx) {
                Some(raw) => parse_number(row_idx, column, raw)?,
                None => match (cfg.missing_exogenous, last_exogenous[slot]) {
                    (MissingExogenousPolicy::ForwardFill, Some(previous)) => {
                        report.forward_filled_cells += 1;
                        previous
                    }
                    _ => {
                        return Err(IngestError::MissingExogenous {
                            row: row_idx,
                            column: column.clone(),
                        });
                    }
                },
            };
            last_exogenous[slot] = Some(parsed);
            exogenous.push(parsed);
        }

        observations.push(Observation::with_exogenous(ts_ms_utc, value, exogenous));
    }

    observations.sort_by_key(|row| row.ts_ms_utc);
    let observations = enforce_grid(observations, cfg.gap_fill, features.step_ms, &mut report)?;
    report.output_rows = observations.len() as u64;

    info!(
        component = "ingest",
        event = "ingest.clean.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        dropped_missing_target = report.dropped_missing_target,
        forward_filled_cells = report.forward_filled_cells,
        filled_gap_points = report.filled_gap_points
    );

    Ok(CleanedData {
        observations,
        report,
    })
}

fn enforce_grid(
    sorted: Vec<Observation>,
    gap_fill: GapFillPolicy,
    step_ms: i64,
    report: &mut CleaningReport,
) -> Result<Vec<Observation>, IngestError> {
    let mut out: Vec<Observation> = Vec::with_capacity(sorted.len());
    for row in sorted {
        if !is_on_grid(row.ts_ms_utc, step_ms) {
            return Err(IngestError::OffGridTimestamp {
                ts_ms_utc: row.ts_ms_utc,
                step_ms,
            });
        }
        if let Some(previous) = out.last() {
            if previous.ts_ms_utc == row.ts_ms_utc {
                return Err(IngestError::DuplicateTimestamp {
                    ts_ms_utc: row.ts_ms_utc,
                });
            }
            let expected = previous.ts_ms_utc + step_ms;
            if row.ts_ms_utc != expected {
                let missing_points = ((row.ts_ms_utc - expected) / step_ms) as u64;
                match gap_fill {
                    GapFillPolicy::Reject => {
                        return Err(IngestError::ContinuityGap {
                            expected_next_ts_ms_utc: expected,
                            actual_ts_ms_utc: row.ts_ms_utc,
                            missing_points,
                        });
                    }
                    GapFillPolicy::ForwardFill => {
                        warn!(
                            component = "ingest",
                            event = "ingest.clean.gap_filled",
                            expected_next_ts_ms_utc = expected,
                            actual_ts_ms_utc = row.ts_ms_utc,
                            missing_points = missing_points
                        );
                        let template = previous.clone();
                        let mut ts = expected;
                        while ts < row.ts_ms_utc {
                            out.push(Observation {
                                ts_ms_utc: ts,
                                ..template.clone()
                            });
                            ts += step_ms;
                        }
                        report.filled_gap_points += missing_points;
                    }
                }
            }
        }
        out.push(row);
    }
    Ok(out)
}

fn row_timestamp(
    row: usize,
    primary: Option<&str>,
    hour: Option<&str>,
    tz: &Tz,
) -> Result<i64, IngestError> {
    let primary = primary.ok_or_else(|| IngestError::ParseTimestamp {
        row,
        value: String::new(),
    })?;

    let naive = match hour {
        None => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(primary) {
                return Ok(dt.timestamp_millis());
            }
            // Offset-less values are local to the configured zone.
            let utc_ms = parse_timestamp_ms(primary).ok_or_else(|| IngestError::ParseTimestamp {
                row,
                value: primary.to_string(),
            })?;
            chrono::DateTime::from_timestamp_millis(utc_ms)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| IngestError::ParseTimestamp {
                    row,
                    value: primary.to_string(),
                })?
        }
        Some(hour_raw) => {
            let date = NaiveDate::parse_from_str(primary, "%Y-%m-%d").map_err(|_| {
                IngestError::ParseTimestamp {
                    row,
                    value: primary.to_string(),
                }
            })?;
            let hour: i64 = hour_raw
                .parse::<f64>()
                .ok()
                .filter(|h| h.fract() == 0.0 && (0.0..24.0).contains(h))
                .map(|h| h as i64)
                .ok_or_else(|| IngestError::ParseTimestamp {
                    row,
                    value: format!("{primary} {hour_raw}"),
                })?;
            local_midnight(date) + ChronoDuration::hours(hour)
        }
    };

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| IngestError::NonexistentLocalTime {
            row,
            value: naive.to_string(),
        })
}

fn local_midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn parse_number(row: usize, column: &str, raw: &str) -> Result<f64, IngestError> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| IngestError::ParseNumber {
            row,
            column: column.to_string(),
            value: raw.to_string(),
        })
}

fn normalize_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || MISSING_MARKERS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::HOUR_MS;

    const JAN_1_2011_MS: i64 = 1_293_840_000_000;

    fn cells(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|value| normalize_cell(value)).collect()
    }

    fn bike_table(rows: &[[&str; 6]]) -> RawTable {
        RawTable::new(
            ["dteday", "hr", "temp", "casual", "registered", "cnt"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            rows.iter().map(|row| cells(row)).collect(),
        )
    }

    fn bike_cleaning() -> CleaningConfig {
        CleaningConfig {
            rename: BTreeMap::from([("cnt".to_string(), "count".to_string())]),
            drop_columns: vec!["casual".to_string(), "registered".to_string()],
            timestamp: TimestampSource::DateHour {
                date_column: "dteday".to_string(),
                hour_column: "hr".to_string(),
            },
            target_column: "count".to_string(),
            missing_target: MissingTargetPolicy::DropRow,
            missing_exogenous: MissingExogenousPolicy::ForwardFill,
            gap_fill: GapFillPolicy::ForwardFill,
        }
    }

    fn bike_features() -> FeatureTransformConfig {
        FeatureTransformConfig {
            exogenous_columns: vec!["temp".to_string()],
            ..FeatureTransformConfig::default()
        }
    }

    #[test]
    fn date_hour_rows_become_hourly_observations() {
        let table = bike_table(&[
            ["2011-01-01", "0", "0.24", "3", "13", "16"],
            ["2011-01-01", "1", "", "8", "32", "40"],
            ["2011-01-01", "2", "0.22", "5", "27", "32"],
        ]);

        let cleaned = clean_raw_table(&table, &bike_cleaning(), &bike_features())
            .expect("cleaning should succeed");

        let ts: Vec<i64> = cleaned.observations.iter().map(|o| o.ts_ms_utc).collect();
        assert_eq!(
            ts,
            vec![JAN_1_2011_MS, JAN_1_2011_MS + HOUR_MS, JAN_1_2011_MS + 2 * HOUR_MS]
        );
        assert_eq!(cleaned.observations[1].value, 40.0);
        assert_eq!(cleaned.observations[1].exogenous, vec![0.24]);
        assert_eq!(cleaned.report.forward_filled_cells, 1);
        assert_eq!(cleaned.report.dropped_columns, vec!["casual", "registered"]);
    }

    #[test]
    fn missing_target_rows_are_dropped_and_the_gap_forward_filled() {
        let table = bike_table(&[
            ["2011-01-01", "0", "0.24", "3", "13", "16"],
            ["2011-01-01", "1", "0.22", "8", "32", "NA"],
            ["2011-01-01", "2", "0.22", "5", "27", "32"],
        ]);

        let cleaned = clean_raw_table(&table, &bike_cleaning(), &bike_features())
            .expect("cleaning should succeed");

        assert_eq!(cleaned.report.dropped_missing_target, 1);
        assert_eq!(cleaned.report.filled_gap_points, 1);
        assert_eq!(cleaned.observations.len(), 3);
        assert_eq!(cleaned.observations[1].value, 16.0);
    }

    #[test]
    fn reject_policy_fails_on_gap_and_duplicates_always_fail() {
        let table = bike_table(&[
            ["2011-01-01", "0", "0.24", "3", "13", "16"],
            ["2011-01-01", "3", "0.22", "5", "27", "32"],
        ]);
        let cfg = CleaningConfig {
            gap_fill: GapFillPolicy::Reject,
            ..bike_cleaning()
        };
        let err = clean_raw_table(&table, &cfg, &bike_features()).expect_err("gap must fail");
        assert!(matches!(
            err,
            IngestError::ContinuityGap {
                missing_points: 2,
                ..
            }
        ));

        let table = bike_table(&[
            ["2011-01-01", "0", "0.24", "3", "13", "16"],
            ["2011-01-01", "0", "0.22", "5", "27", "32"],
        ]);
        let err =
            clean_raw_table(&table, &bike_cleaning(), &bike_features()).expect_err("dup must fail");
        assert!(matches!(err, IngestError::DuplicateTimestamp { .. }));
    }

    #[test]
    fn dropped_column_cannot_be_used_as_target() {
        let table = bike_table(&[["2011-01-01", "0", "0.24", "3", "13", "16"]]);
        let cfg = CleaningConfig {
            target_column: "casual".to_string(),
            ..bike_cleaning()
        };
        let err = clean_raw_table(&table, &cfg, &bike_features()).expect_err("must fail");
        assert!(matches!(err, IngestError::MissingColumn(column) if column == "casual"));
    }

    #[test]
    fn local_dates_are_shifted_by_timezone() {
        let table = bike_table(&[["2011-01-01", "0", "0.24", "3", "13", "16"]]);
        let features = FeatureTransformConfig {
            timezone: "America/New_York".to_string(),
            ..bike_features()
        };
        let cleaned =
            clean_raw_table(&table, &bike_cleaning(), &features).expect("cleaning should succeed");
        assert_eq!(cleaned.observations[0].ts_ms_utc, JAN_1_2011_MS + 5 * HOUR_MS);
    }
}
