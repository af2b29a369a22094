//! Predicted-versus-actual comparison hand-off.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::series::{format_ts, Observation, PredictionRow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonPoint {
    pub ts_ms_utc: i64,
    pub actual: f64,
    pub predicted: f64,
}

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("failed to write comparison output {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write comparison CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Receives the aligned prediction and observation tables once per run.
pub trait Plotter {
    fn plot(&mut self, predictions: &[PredictionRow], actuals: &[Observation])
        -> Result<(), PlotError>;
}

/// Inner join on timestamp, ascending. Unmatched rows on either side drop out.
pub fn align_predictions_with_actuals(
    predictions: &[PredictionRow],
    actuals: &[Observation],
) -> (Vec<PredictionRow>, Vec<Observation>) {
    let actual_by_ts: BTreeMap<i64, &Observation> =
        actuals.iter().map(|row| (row.ts_ms_utc, row)).collect();
    let prediction_by_ts: BTreeMap<i64, &PredictionRow> =
        predictions.iter().map(|row| (row.ts_ms_utc, row)).collect();

    prediction_by_ts
        .into_iter()
        .filter_map(|(ts, prediction)| {
            actual_by_ts
                .get(&ts)
                .map(|actual| (prediction.clone(), (*actual).clone()))
        })
        .unzip()
}

pub fn comparison_points(
    predictions: &[PredictionRow],
    actuals: &[Observation],
) -> Vec<ComparisonPoint> {
    let (predictions, actuals) = align_predictions_with_actuals(predictions, actuals);
    predictions
        .iter()
        .zip(actuals.iter())
        .map(|(prediction, actual)| ComparisonPoint {
            ts_ms_utc: prediction.ts_ms_utc,
            actual: actual.value,
            predicted: prediction.predicted_value,
        })
        .collect()
}

/// Writes `ts_utc,actual,predicted` rows; charting is left to downstream tools.
#[derive(Debug, Clone)]
pub struct CsvComparisonPlotter {
    path: PathBuf,
}

impl CsvComparisonPlotter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct ComparisonRecord {
    ts_utc: String,
    actual: f64,
    predicted: f64,
}

impl Plotter for CsvComparisonPlotter {
    fn plot(
        &mut self,
        predictions: &[PredictionRow],
        actuals: &[Observation],
    ) -> Result<(), PlotError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| PlotError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let points = comparison_points(predictions, actuals);
        let mut writer = csv::Writer::from_path(&self.path)?;
        for point in &points {
            writer.serialize(ComparisonRecord {
                ts_utc: format_ts(point.ts_ms_utc),
                actual: point.actual,
                predicted: point.predicted,
            })?;
        }
        writer.flush().map_err(|source| PlotError::Io {
            path: self.path.clone(),
            source,
        })?;

        info!(
            component = "report",
            event = "report.comparison.written",
            path = %self.path.display(),
            points = points.len()
        );
        Ok(())
    }
}
