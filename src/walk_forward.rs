//! Walk-forward driver: predict the next timestamp, then reveal its actual.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RunnerSection;
use crate::pipeline::{PipelineError, PipelineRunner};
use crate::report::{align_predictions_with_actuals, Plotter};
use crate::series::{format_ts, Observation};
use crate::store::StoreTable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsufficientHistoryAction {
    /// Log the timestamp and move on.
    #[default]
    Skip,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkForwardPlan {
    pub first_ts_ms_utc: i64,
    pub increment_ms: i64,
    pub num_timestamps: usize,
    pub on_insufficient_history: InsufficientHistoryAction,
}

impl WalkForwardPlan {
    pub fn from_config(runner: &RunnerSection) -> Self {
        Self {
            first_ts_ms_utc: runner.first_timestamp,
            increment_ms: runner.time_increment_ms,
            num_timestamps: runner.num_timestamps,
            on_insufficient_history: runner.on_insufficient_history,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkForwardSummary {
    pub steps: usize,
    pub predicted: usize,
    pub skipped_insufficient_history: usize,
    /// Timestamps that already had a prediction from an earlier run.
    pub already_predicted: usize,
    pub observations_appended: usize,
    /// The feed had no actual for a step and the store held none either, so
    /// the walk stopped early.
    pub feed_exhausted: bool,
    pub aligned_points: usize,
}

/// Runs `plan.num_timestamps` inference steps starting at `plan.first_ts_ms_utc`.
///
/// After each step the actual observation for the cursor is taken from `feed`
/// and appended to the store when it is newer than everything stored. The walk
/// stops early when the feed has no actual to reveal. Once the loop ends, predictions and observations are aligned on timestamp and handed
/// to `plotter` exactly once.
pub fn run_walk_forward(
    runner: &mut PipelineRunner,
    feed: &[Observation],
    plan: &WalkForwardPlan,
    plotter: &mut dyn Plotter,
) -> Result<WalkForwardSummary, PipelineError> {
    let feed_by_ts: BTreeMap<i64, &Observation> =
        feed.iter().map(|row| (row.ts_ms_utc, row)).collect();
    let mut summary = WalkForwardSummary::default();
    let mut cursor = plan.first_ts_ms_utc;

    info!(
        component = "walk_forward",
        event = "walk_forward.start",
        first_ts_utc = %format_ts(plan.first_ts_ms_utc),
        increment_ms = plan.increment_ms,
        num_timestamps = plan.num_timestamps,
        feed_rows = feed.len()
    );

    for step in 0..plan.num_timestamps {
        summary.steps += 1;

        let last_prediction = runner.store().last_ts(StoreTable::Predictions)?;
        if last_prediction.is_some_and(|last| last >= cursor) {
            summary.already_predicted += 1;
        } else {
            match runner.run_inference(cursor) {
                Ok(_) => summary.predicted += 1,
                Err(err)
                    if err.is_insufficient_history()
                        && plan.on_insufficient_history == InsufficientHistoryAction::Skip =>
                {
                    summary.skipped_insufficient_history += 1;
                    warn!(
                        component = "walk_forward",
                        event = "walk_forward.step.skipped",
                        step = step,
                        ts_utc = %format_ts(cursor),
                        error = %err
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let last_observation = runner.store().last_ts(StoreTable::Observations)?;
        if last_observation.map_or(true, |last| last < cursor) {
            let Some(actual) = feed_by_ts.get(&cursor) else {
                // The next step would have no observation one interval back.
                summary.feed_exhausted = true;
                info!(
                    component = "walk_forward",
                    event = "walk_forward.feed_exhausted",
                    step = step,
                    ts_utc = %format_ts(cursor),
                    remaining_steps = plan.num_timestamps - step - 1
                );
                break;
            };
            runner.append_observation(actual)?;
            summary.observations_appended += 1;
        }

        cursor += plan.increment_ms;
    }

    let predictions = runner.store().load_all_predictions()?;
    let actuals = runner.store().load_all_observations()?;
    let (aligned_predictions, aligned_actuals) =
        align_predictions_with_actuals(&predictions, &actuals);
    summary.aligned_points = aligned_predictions.len();
    plotter.plot(&aligned_predictions, &aligned_actuals)?;

    info!(
        component = "walk_forward",
        event = "walk_forward.finish",
        steps = summary.steps,
        predicted = summary.predicted,
        skipped = summary.skipped_insufficient_history,
        already_predicted = summary.already_predicted,
        observations_appended = summary.observations_appended,
        feed_exhausted = summary.feed_exhausted,
        aligned_points = summary.aligned_points
    );
    Ok(summary)
}
