//! Hyperparameter search and final fit over a labelled feature table.
//!
//! Validation rows are always the most recent slice of the table, so every
//! validation timestamp is later than every training timestamp. The search is
//! a seeded random search; identical inputs and seed give identical trials.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{ModelArtifact, ARTIFACT_FORMAT_VERSION};
use crate::features::{FeatureRow, FeatureSchema};
use crate::model::{mae, rmse, EvalSet, GbtModel, GbtParams, ModelError};
use crate::series::format_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntRange {
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub n_estimators: IntRange,
    /// Sampled log-uniformly.
    pub learning_rate: FloatRange,
    pub max_depth: IntRange,
    pub min_samples_leaf: IntRange,
    pub l2_regularization: FloatRange,
    pub trial_budget: usize,
    /// Wall-clock budget; once spent the best trial so far wins.
    pub max_search_seconds: Option<u64>,
    pub seed: u64,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            n_estimators: IntRange { min: 50, max: 400 },
            learning_rate: FloatRange {
                min: 0.01,
                max: 0.3,
            },
            max_depth: IntRange { min: 3, max: 8 },
            min_samples_leaf: IntRange { min: 1, max: 30 },
            l2_regularization: FloatRange { min: 0.0, max: 10.0 },
            trial_budget: 20,
            max_search_seconds: None,
            seed: 42,
        }
    }
}

impl SearchSpace {
    pub fn validate(&self) -> Result<(), TrainError> {
        let int_ranges = [
            ("n_estimators", self.n_estimators),
            ("max_depth", self.max_depth),
            ("min_samples_leaf", self.min_samples_leaf),
        ];
        for (name, range) in int_ranges {
            if range.min == 0 || range.min > range.max {
                return Err(TrainError::InvalidSearchSpace(format!(
                    "{name} range must satisfy 0 < min <= max"
                )));
            }
        }
        let lr = self.learning_rate;
        if !(lr.min.is_finite() && lr.max.is_finite() && lr.min > 0.0 && lr.min <= lr.max) {
            return Err(TrainError::InvalidSearchSpace(
                "learning_rate range must satisfy 0 < min <= max".to_string(),
            ));
        }
        let l2 = self.l2_regularization;
        if !(l2.min.is_finite() && l2.max.is_finite() && l2.min >= 0.0 && l2.min <= l2.max) {
            return Err(TrainError::InvalidSearchSpace(
                "l2_regularization range must satisfy 0 <= min <= max".to_string(),
            ));
        }
        if self.trial_budget == 0 {
            return Err(TrainError::InvalidSearchSpace(
                "trial_budget must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> GbtParams {
        GbtParams {
            n_estimators: sample_int(rng, self.n_estimators),
            learning_rate: sample_log(rng, self.learning_rate),
            max_depth: sample_int(rng, self.max_depth),
            min_samples_leaf: sample_int(rng, self.min_samples_leaf),
            l2_regularization: sample_uniform(rng, self.l2_regularization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationStrategy {
    /// Share of the most recent rows held out for validation.
    pub validation_fraction: f64,
    pub min_training_rows: usize,
    /// Refit the winner on train + validation instead of train only.
    pub refit_on_full: bool,
    pub early_stopping_rounds: Option<usize>,
}

impl Default for ValidationStrategy {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            min_training_rows: 50,
            refit_on_full: false,
            early_stopping_rounds: Some(25),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub index: usize,
    /// `n_estimators` is the best iteration found on validation.
    pub params: GbtParams,
    pub validation_rmse: f64,
    pub validation_mae: f64,
}

impl TrialOutcome {
    fn complexity(&self) -> u128 {
        let depth = self.params.max_depth.min(64) as u32;
        (self.params.n_estimators as u128) << depth
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub best_trial: usize,
    pub best_params: GbtParams,
    pub validation_rmse: f64,
    pub validation_mae: f64,
    pub train_rmse: f64,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub stopped_by_clock: bool,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub search_elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("insufficient data: {rows} labelled rows, need at least {required}")]
    InsufficientData { rows: usize, required: usize },
    #[error("hyperparameter search exhausted: {attempted} trials attempted, {failed} failed")]
    SearchExhausted { attempted: usize, failed: usize },
    #[error("invalid search space: {0}")]
    InvalidSearchSpace(String),
    #[error("invalid validation strategy: {0}")]
    InvalidValidation(String),
    #[error("feature row at {} has no label", format_ts(*ts_ms_utc))]
    MissingLabel { ts_ms_utc: i64 },
    #[error(
        "feature rows out of temporal order: {} after {}",
        format_ts(*ts_ms_utc),
        format_ts(*previous_ts_ms_utc)
    )]
    OutOfOrder {
        previous_ts_ms_utc: i64,
        ts_ms_utc: i64,
    },
    #[error("feature row at {ts_ms_utc} has {actual} values, schema has {expected} columns")]
    SchemaWidth {
        ts_ms_utc: i64,
        expected: usize,
        actual: usize,
    },
    #[error("final fit failed: {0}")]
    FinalFit(#[from] ModelError),
}

struct Split {
    train_x: Vec<Vec<f64>>,
    train_y: Vec<f64>,
    valid_x: Vec<Vec<f64>>,
    valid_y: Vec<f64>,
    last_ts_ms_utc: i64,
}

/// Runs the search and fits the final model. Performs no I/O.
pub fn train(
    schema: &FeatureSchema,
    rows: &[FeatureRow],
    search: &SearchSpace,
    validation: &ValidationStrategy,
) -> Result<(ModelArtifact, TrainingMetrics), TrainError> {
    search.validate()?;
    validate_strategy(validation)?;
    let split = temporal_split(schema, rows, validation)?;

    info!(
        component = "trainer",
        event = "trainer.search.start",
        train_rows = split.train_x.len(),
        validation_rows = split.valid_x.len(),
        trial_budget = search.trial_budget,
        max_search_seconds = ?search.max_search_seconds,
        seed = search.seed
    );

    let started = Instant::now();
    let clock_budget = search.max_search_seconds.map(Duration::from_secs);
    let mut rng = ChaCha8Rng::seed_from_u64(search.seed);
    let mut best: Option<TrialOutcome> = None;
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut stopped_by_clock = false;

    for index in 0..search.trial_budget {
        if index > 0 {
            if let Some(budget) = clock_budget {
                if started.elapsed() >= budget {
                    stopped_by_clock = true;
                    warn!(
                        component = "trainer",
                        event = "trainer.search.clock_exhausted",
                        trials_attempted = index,
                        budget_seconds = budget.as_secs()
                    );
                    break;
                }
            }
        }

        let params = search.sample(&mut rng);
        match run_trial(index, &params, &split, validation) {
            Ok(outcome) => {
                completed += 1;
                debug!(
                    component = "trainer",
                    event = "trainer.trial.finish",
                    trial = index,
                    validation_rmse = outcome.validation_rmse,
                    best_iteration = outcome.params.n_estimators,
                    max_depth = outcome.params.max_depth,
                    learning_rate = outcome.params.learning_rate
                );
                let replace = best
                    .as_ref()
                    .map_or(true, |current| rank(&outcome, current) == Ordering::Less);
                if replace {
                    best = Some(outcome);
                }
            }
            Err(err) => {
                failed += 1;
                warn!(
                    component = "trainer",
                    event = "trainer.trial.failed",
                    trial = index,
                    error = %err
                );
            }
        }
    }

    let attempted = completed + failed;
    let best = best.ok_or(TrainError::SearchExhausted { attempted, failed })?;
    let search_elapsed_ms = started.elapsed().as_millis() as u64;

    info!(
        component = "trainer",
        event = "trainer.search.finish",
        best_trial = best.index,
        validation_rmse = best.validation_rmse,
        trials_completed = completed,
        trials_failed = failed,
        stopped_by_clock = stopped_by_clock,
        elapsed_ms = search_elapsed_ms
    );

    let (fit_x, fit_y) = if validation.refit_on_full {
        let mut x = split.train_x.clone();
        x.extend(split.valid_x.iter().cloned());
        let mut y = split.train_y.clone();
        y.extend(split.valid_y.iter().copied());
        (x, y)
    } else {
        (split.train_x.clone(), split.train_y.clone())
    };

    let model = GbtModel::fit(&best.params, &fit_x, &fit_y)?;
    let train_rmse = rmse(&model.predict_many(&fit_x)?, &fit_y);

    let metrics = TrainingMetrics {
        best_trial: best.index,
        best_params: best.params.clone(),
        validation_rmse: best.validation_rmse,
        validation_mae: best.validation_mae,
        train_rmse,
        trials_completed: completed,
        trials_failed: failed,
        stopped_by_clock,
        train_rows: split.train_x.len(),
        validation_rows: split.valid_x.len(),
        search_elapsed_ms,
    };

    info!(
        component = "trainer",
        event = "trainer.fit.finish",
        fit_rows = fit_x.len(),
        trees = model.n_trees(),
        train_rmse = train_rmse,
        refit_on_full = validation.refit_on_full
    );

    let artifact = ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        feature_names: schema.column_names(),
        feature_schema_version: schema.version,
        feature_fingerprint: schema.fingerprint.clone(),
        params: best.params,
        model,
        metrics: metrics.clone(),
        trained_at_ms: Utc::now().timestamp_millis(),
        last_training_ts_ms_utc: split.last_ts_ms_utc,
    };

    Ok((artifact, metrics))
}

/// Lower validation RMSE, then lower complexity, then earlier trial.
fn rank(a: &TrialOutcome, b: &TrialOutcome) -> Ordering {
    a.validation_rmse
        .total_cmp(&b.validation_rmse)
        .then_with(|| a.complexity().cmp(&b.complexity()))
        .then_with(|| a.index.cmp(&b.index))
}

fn run_trial(
    index: usize,
    params: &GbtParams,
    split: &Split,
    validation: &ValidationStrategy,
) -> Result<TrialOutcome, ModelError> {
    let (model, trace) = GbtModel::fit_with_eval(
        params,
        &split.train_x,
        &split.train_y,
        Some(EvalSet {
            rows: &split.valid_x,
            labels: &split.valid_y,
            early_stopping_rounds: validation.early_stopping_rounds,
        }),
    )?;
    let predictions = model.predict_many(&split.valid_x)?;
    let validation_rmse = rmse(&predictions, &split.valid_y);
    let validation_mae = mae(&predictions, &split.valid_y);
    if !validation_rmse.is_finite() || !validation_mae.is_finite() {
        return Err(ModelError::NonFinite { stage: "validation" });
    }

    Ok(TrialOutcome {
        index,
        params: GbtParams {
            n_estimators: trace.best_iteration.max(1),
            ..params.clone()
        },
        validation_rmse,
        validation_mae,
    })
}

pub(crate) fn validate_strategy(validation: &ValidationStrategy) -> Result<(), TrainError> {
    let fraction = validation.validation_fraction;
    if !(fraction.is_finite() && fraction > 0.0 && fraction < 1.0) {
        return Err(TrainError::InvalidValidation(
            "validation_fraction must be in (0, 1)".to_string(),
        ));
    }
    if validation.early_stopping_rounds == Some(0) {
        return Err(TrainError::InvalidValidation(
            "early_stopping_rounds must be > 0 when set".to_string(),
        ));
    }
    Ok(())
}

fn temporal_split(
    schema: &FeatureSchema,
    rows: &[FeatureRow],
    validation: &ValidationStrategy,
) -> Result<Split, TrainError> {
    let required = validation.min_training_rows.max(2);
    if rows.len() < required {
        return Err(TrainError::InsufficientData {
            rows: rows.len(),
            required,
        });
    }

    let width = schema.columns.len();
    let mut previous: Option<i64> = None;
    let mut x = Vec::with_capacity(rows.len());
    let mut y = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(previous_ts_ms_utc) = previous {
            if row.ts_ms_utc <= previous_ts_ms_utc {
                return Err(TrainError::OutOfOrder {
                    previous_ts_ms_utc,
                    ts_ms_utc: row.ts_ms_utc,
                });
            }
        }
        previous = Some(row.ts_ms_utc);
        if row.values.len() != width {
            return Err(TrainError::SchemaWidth {
                ts_ms_utc: row.ts_ms_utc,
                expected: width,
                actual: row.values.len(),
            });
        }
        let label = row.label.ok_or(TrainError::MissingLabel {
            ts_ms_utc: row.ts_ms_utc,
        })?;
        x.push(row.values.clone());
        y.push(label);
    }

    let n_valid = ((rows.len() as f64) * validation.validation_fraction).ceil() as usize;
    let n_valid = n_valid.clamp(1, rows.len() - 1);
    let n_train = rows.len() - n_valid;

    let valid_x = x.split_off(n_train);
    let valid_y = y.split_off(n_train);

    Ok(Split {
        train_x: x,
        train_y: y,
        valid_x,
        valid_y,
        last_ts_ms_utc: previous.unwrap_or_default(),
    })
}

fn sample_int(rng: &mut ChaCha8Rng, range: IntRange) -> usize {
    rng.gen_range(range.min..=range.max)
}

fn sample_uniform(rng: &mut ChaCha8Rng, range: FloatRange) -> f64 {
    if range.max > range.min {
        rng.gen_range(range.min..range.max)
    } else {
        range.min
    }
}

fn sample_log(rng: &mut ChaCha8Rng, range: FloatRange) -> f64 {
    if range.max > range.min {
        rng.gen_range(range.min.ln()..range.max.ln()).exp()
    } else {
        range.min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, rmse: f64, trees: usize, depth: usize) -> TrialOutcome {
        TrialOutcome {
            index,
            params: GbtParams {
                n_estimators: trees,
                max_depth: depth,
                ..GbtParams::default()
            },
            validation_rmse: rmse,
            validation_mae: rmse,
        }
    }

    #[test]
    fn ranking_prefers_error_then_complexity_then_index() {
        let a = outcome(3, 1.0, 10, 3);
        let b = outcome(1, 2.0, 1, 1);
        assert_eq!(rank(&a, &b), Ordering::Less);

        let simple = outcome(5, 1.0, 10, 2);
        let complex = outcome(0, 1.0, 10, 4);
        assert_eq!(rank(&simple, &complex), Ordering::Less);

        let early = outcome(0, 1.0, 10, 2);
        let late = outcome(7, 1.0, 10, 2);
        assert_eq!(rank(&early, &late), Ordering::Less);
    }

    #[test]
    fn sampling_respects_ranges_and_seed() {
        let space = SearchSpace::default();
        let mut rng_a = ChaCha8Rng::seed_from_u64(7);
        let mut rng_b = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..50 {
            let a = space.sample(&mut rng_a);
            let b = space.sample(&mut rng_b);
            assert_eq!(a, b);
            assert!((50..=400).contains(&a.n_estimators));
            assert!(a.learning_rate >= 0.01 && a.learning_rate < 0.3 + 1e-12);
            assert!((3..=8).contains(&a.max_depth));
        }
    }

    #[test]
    fn degenerate_ranges_sample_their_single_value() {
        let space = SearchSpace {
            learning_rate: FloatRange { min: 0.1, max: 0.1 },
            l2_regularization: FloatRange { min: 0.0, max: 0.0 },
            ..SearchSpace::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let params = space.sample(&mut rng);
        assert_eq!(params.learning_rate, 0.1);
        assert_eq!(params.l2_regularization, 0.0);
    }

    #[test]
    fn invalid_search_space_is_rejected() {
        let space = SearchSpace {
            max_depth: IntRange { min: 5, max: 2 },
            ..SearchSpace::default()
        };
        assert!(matches!(
            space.validate(),
            Err(TrainError::InvalidSearchSpace(_))
        ));
        let space = SearchSpace {
            trial_budget: 0,
            ..SearchSpace::default()
        };
        assert!(space.validate().is_err());
    }
}
