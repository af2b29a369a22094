use std::f64::consts::PI;
use std::path::Path;

use lagcast::{
    format_ts, run_walk_forward, CsvComparisonPlotter, FeatureError, InMemoryRawSource,
    InsufficientHistoryAction, IngestError, ModelLoadError, Observation, PipelineConfig,
    PipelineError, PipelineRunner, PlotError, Plotter, PredictionRow, RawTable, RunnerState,
    StoreError, StoreTable, WalkForwardPlan, HOUR_MS,
};
use serde_json::json;
use tempfile::TempDir;

const START_TS_MS: i64 = 1_293_840_000_000; // 2011-01-01T00:00:00Z
const HISTORY_HOURS: i64 = 240;
const HISTORY_PATH: &str = "raw/history.csv";
const FEED_PATH: &str = "raw/feed.csv";

fn demand(hour_index: i64) -> f64 {
    let hour = (hour_index % 24) as f64;
    200.0 + 80.0 * (2.0 * PI * hour / 24.0).sin() + ((hour_index * 7) % 5) as f64
}

fn raw_table(hours: std::ops::Range<i64>) -> RawTable {
    RawTable::new(
        vec!["timestamp".to_string(), "value".to_string()],
        hours
            .map(|i| {
                vec![
                    Some(format_ts(START_TS_MS + i * HOUR_MS)),
                    Some(demand(i).to_string()),
                ]
            })
            .collect(),
    )
}

fn source() -> InMemoryRawSource {
    let mut source = InMemoryRawSource::new();
    source.insert(HISTORY_PATH, raw_table(0..HISTORY_HOURS));
    source.insert(FEED_PATH, raw_table(0..HISTORY_HOURS + 48));
    source
}

fn config(dir: &Path, lags: &[u32], first_hour: i64, steps: usize) -> PipelineConfig {
    let raw = json!({
        "pipeline_runner": {
            "first_timestamp": format_ts(START_TS_MS + first_hour * HOUR_MS),
            "time_increment": "1h",
            "num_timestamps": steps
        },
        "data_manager": {
            "raw_data_path": HISTORY_PATH,
            "real_time_data_path": FEED_PATH,
            "prod_database_path": dir.join("prod").join("prod.sqlite"),
            "model_dir": dir.join("models"),
            "comparison_output_path": dir.join("reports").join("comparison.csv")
        },
        "features": {
            "lags": lags,
            "calendar_fields": ["hour", "day_of_week"],
            "lookback_length": 24,
            "step": "1h"
        },
        "training": {
            "n_estimators": {"min": 10, "max": 30},
            "learning_rate": {"min": 0.1, "max": 0.3},
            "max_depth": {"min": 2, "max": 4},
            "min_samples_leaf": {"min": 2, "max": 8},
            "trial_budget": 3,
            "seed": 3,
            "min_training_rows": 48,
            "early_stopping_rounds": 5
        }
    });
    PipelineConfig::from_json_str(&raw.to_string()).expect("valid config")
}

fn runner(dir: &TempDir) -> PipelineRunner {
    runner_with(dir, &[1, 2, 24], HISTORY_HOURS, 5)
}

fn runner_with(dir: &TempDir, lags: &[u32], first_hour: i64, steps: usize) -> PipelineRunner {
    PipelineRunner::new(
        config(dir.path(), lags, first_hour, steps),
        Box::new(source()),
    )
    .expect("runner opens")
}

fn ts(hour: i64) -> i64 {
    START_TS_MS + hour * HOUR_MS
}

#[derive(Default)]
struct RecordingPlotter {
    calls: usize,
    predictions: Vec<PredictionRow>,
    actuals: Vec<Observation>,
}

impl Plotter for RecordingPlotter {
    fn plot(
        &mut self,
        predictions: &[PredictionRow],
        actuals: &[Observation],
    ) -> Result<(), PlotError> {
        self.calls += 1;
        self.predictions = predictions.to_vec();
        self.actuals = actuals.to_vec();
        Ok(())
    }
}

#[test]
fn training_persists_an_artifact_and_returns_to_idle() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    assert_eq!(runner.state(), RunnerState::Idle);

    let report = runner.run_training().expect("training succeeds");

    assert_eq!(runner.state(), RunnerState::Idle);
    assert_eq!(report.observations, HISTORY_HOURS as usize);
    assert_eq!(report.feature_rows, HISTORY_HOURS as usize - 24);
    assert!(report.artifact_path.exists());
    assert_eq!(report.artifact_path, runner.model_slot().latest_path());
    assert!(report.metrics.validation_rmse.is_finite());
    assert_eq!(
        runner.store().count(StoreTable::Observations).expect("count"),
        HISTORY_HOURS as u64
    );
}

#[test]
fn five_increasing_inferences_append_five_ordered_predictions() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    let report = runner.run_training().expect("training succeeds");

    let hours = [200, 201, 202, 203, 204];
    for hour in hours {
        let row = runner.run_inference(ts(hour)).expect("inference succeeds");
        assert_eq!(row.ts_ms_utc, ts(hour));
        assert!(row.predicted_value.is_finite());
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    let predictions = runner.store().load_all_predictions().expect("predictions");
    let stored: Vec<i64> = predictions.iter().map(|row| row.ts_ms_utc).collect();
    assert_eq!(stored, hours.map(ts).to_vec());
    assert!(predictions
        .iter()
        .all(|row| row.model_fingerprint == report.model_fingerprint));

    // The store still holds only ground truth.
    assert_eq!(
        runner.store().count(StoreTable::Observations).expect("count"),
        HISTORY_HOURS as u64
    );
}

#[test]
fn inference_without_enough_history_appends_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    runner.run_training().expect("training succeeds");

    let err = runner.run_inference(ts(10)).expect_err("only ten prior points");

    assert!(err.is_insufficient_history());
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::InsufficientHistory {
            required: 24,
            available: 10,
            ..
        })
    ));
    assert_eq!(runner.state(), RunnerState::Idle);
    assert_eq!(
        runner.store().count(StoreTable::Predictions).expect("count"),
        0
    );
}

#[test]
fn repeated_or_gapped_targets_fail_without_writing() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    runner.run_training().expect("training succeeds");
    runner.run_inference(ts(100)).expect("first inference");

    let err = runner.run_inference(ts(100)).expect_err("same timestamp twice");
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::OutOfOrderWrite { .. })
    ));

    // Nothing is stored for hour 240 yet, so hour 241 has a hole in its window.
    let err = runner.run_inference(ts(HISTORY_HOURS + 1)).expect_err("gap");
    assert!(matches!(
        err,
        PipelineError::Feature(FeatureError::ContinuityGap { .. })
    ));
    assert!(!err.is_insufficient_history());
    assert_eq!(
        runner.store().count(StoreTable::Predictions).expect("count"),
        1
    );
}

#[test]
fn inference_before_any_training_reports_missing_model() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    runner.initialize_store().expect("initialize");

    let err = runner.run_inference(ts(200)).expect_err("no artifact yet");

    assert!(matches!(
        err,
        PipelineError::ModelLoad(ModelLoadError::Missing { .. })
    ));
    assert_eq!(
        runner.store().count(StoreTable::Predictions).expect("count"),
        0
    );
}

#[test]
fn artifact_trained_on_other_features_is_refused() {
    let dir = TempDir::new().expect("tempdir");
    runner(&dir).run_training().expect("training succeeds");

    let mut other = runner_with(&dir, &[1, 24], HISTORY_HOURS, 5);
    let err = other.run_inference(ts(200)).expect_err("feature mismatch");

    assert!(matches!(
        err,
        PipelineError::ModelLoad(ModelLoadError::FeatureMismatch { .. })
    ));
    assert_eq!(
        other.store().count(StoreTable::Predictions).expect("count"),
        0
    );
}

#[test]
fn failed_training_is_reported_and_can_be_retried() {
    let dir = TempDir::new().expect("tempdir");
    let mut broken = PipelineRunner::new(
        config(dir.path(), &[1, 2, 24], HISTORY_HOURS, 5),
        Box::new(InMemoryRawSource::new()),
    )
    .expect("runner opens");

    let err = broken.run_training().expect_err("no raw history");
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::Ingest(IngestError::SourceMissing { .. }))
    ));
    assert_eq!(broken.state(), RunnerState::TrainingFailed);
    assert!(!broken.store().is_initialized());

    let err = broken.run_inference(ts(200)).expect_err("store never seeded");
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::NotInitialized { .. })
    ));
    assert_eq!(broken.state(), RunnerState::TrainingFailed);
    drop(broken);

    let mut fixed = runner(&dir);
    fixed.run_training().expect("retry succeeds");
    assert_eq!(fixed.state(), RunnerState::Idle);
}

#[test]
fn retraining_invalidates_the_cached_model() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    runner.run_training().expect("first training");
    runner.run_inference(ts(150)).expect("inference with first model");

    let second = runner.run_training().expect("second training");
    let row = runner.run_inference(ts(151)).expect("inference with second model");

    assert_eq!(row.model_fingerprint, second.model_fingerprint);
}

#[test]
fn walk_forward_predicts_reveals_actuals_and_plots_once() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner(&dir);
    runner.run_training().expect("training succeeds");

    let feed = runner
        .load_observations(Path::new(FEED_PATH))
        .expect("feed loads");
    let plan = WalkForwardPlan::from_config(&runner.config().pipeline_runner);
    let mut plotter = RecordingPlotter::default();

    let summary = run_walk_forward(&mut runner, &feed, &plan, &mut plotter).expect("walk forward");

    assert_eq!(summary.steps, 5);
    assert_eq!(summary.predicted, 5);
    assert_eq!(summary.observations_appended, 5);
    assert_eq!(summary.skipped_insufficient_history, 0);
    assert_eq!(summary.aligned_points, 5);
    assert!(!summary.feed_exhausted);

    assert_eq!(plotter.calls, 1);
    let predicted_ts: Vec<i64> = plotter.predictions.iter().map(|row| row.ts_ms_utc).collect();
    let actual_ts: Vec<i64> = plotter.actuals.iter().map(|row| row.ts_ms_utc).collect();
    let expected: Vec<i64> = (HISTORY_HOURS..HISTORY_HOURS + 5).map(ts).collect();
    assert_eq!(predicted_ts, expected);
    assert_eq!(actual_ts, expected);
    assert_eq!(plotter.actuals[0].value, demand(HISTORY_HOURS));

    // A second pass over the same plan does not duplicate predictions.
    let mut second = RecordingPlotter::default();
    let rerun = run_walk_forward(&mut runner, &feed, &plan, &mut second).expect("rerun");
    assert_eq!(rerun.already_predicted, 5);
    assert_eq!(rerun.predicted, 0);
    assert_eq!(rerun.observations_appended, 0);
    assert_eq!(second.predictions.len(), 5);
}

#[test]
fn walk_forward_stops_at_the_end_of_the_feed_and_still_plots() {
    let dir = TempDir::new().expect("tempdir");
    let feed_end = HISTORY_HOURS + 48;
    let mut runner = runner_with(&dir, &[1, 2, 24], feed_end - 2, 5);
    runner.run_training().expect("training succeeds");
    let feed = runner
        .load_observations(Path::new(FEED_PATH))
        .expect("feed loads");
    for row in feed
        .iter()
        .filter(|row| row.ts_ms_utc >= ts(HISTORY_HOURS) && row.ts_ms_utc < ts(feed_end - 2))
    {
        runner.append_observation(row).expect("catch up store");
    }

    let plan = WalkForwardPlan::from_config(&runner.config().pipeline_runner);
    let mut plotter = RecordingPlotter::default();
    let summary = run_walk_forward(&mut runner, &feed, &plan, &mut plotter).expect("walk forward");

    assert!(summary.feed_exhausted);
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.predicted, 3);
    assert_eq!(summary.observations_appended, 2);
    assert_eq!(summary.aligned_points, 2);
    assert_eq!(plotter.calls, 1);
    assert_eq!(
        runner.store().last_ts(StoreTable::Predictions).expect("last prediction"),
        Some(ts(feed_end))
    );
}

#[test]
fn walk_forward_skips_or_aborts_on_insufficient_history() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner_with(&dir, &[1, 2, 24], 5, 3);
    runner.initialize_store().expect("initialize");
    let feed = runner
        .load_observations(Path::new(FEED_PATH))
        .expect("feed loads");

    let plan = WalkForwardPlan::from_config(&runner.config().pipeline_runner);
    assert_eq!(plan.on_insufficient_history, InsufficientHistoryAction::Skip);
    let mut plotter = RecordingPlotter::default();
    let summary = run_walk_forward(&mut runner, &feed, &plan, &mut plotter).expect("skips");

    assert_eq!(summary.skipped_insufficient_history, 3);
    assert_eq!(summary.predicted, 0);
    assert_eq!(plotter.calls, 1);
    assert!(plotter.predictions.is_empty());

    let abort = WalkForwardPlan {
        on_insufficient_history: InsufficientHistoryAction::Abort,
        ..plan
    };
    let mut untouched = RecordingPlotter::default();
    let err = run_walk_forward(&mut runner, &feed, &abort, &mut untouched).expect_err("aborts");
    assert!(err.is_insufficient_history());
    assert_eq!(untouched.calls, 0);
}

#[test]
fn csv_plotter_receives_the_aligned_walk_forward_tables() {
    let dir = TempDir::new().expect("tempdir");
    let mut runner = runner_with(&dir, &[1, 2, 24], HISTORY_HOURS, 3);
    runner.run_training().expect("training succeeds");
    let feed = runner
        .load_observations(Path::new(FEED_PATH))
        .expect("feed loads");
    let plan = WalkForwardPlan::from_config(&runner.config().pipeline_runner);
    let output = runner
        .config()
        .data_manager
        .comparison_output_path
        .clone()
        .expect("output path configured");
    let mut plotter = CsvComparisonPlotter::new(&output);

    run_walk_forward(&mut runner, &feed, &plan, &mut plotter).expect("walk forward");

    let written = std::fs::read_to_string(&output).expect("comparison written");
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "ts_utc,actual,predicted");
    assert!(lines[1].starts_with(&format_ts(ts(HISTORY_HOURS))));
}
