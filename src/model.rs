//! Gradient-boosted regression trees with squared-error loss.
//!
//! Split finding works on per-feature quantile bins computed once per fit, so
//! each node costs one histogram pass over its rows. Fitting is fully
//! deterministic: no row or column sampling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_BINS: usize = 64;
const MIN_SPLIT_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbtParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub l2_regularization: f64,
}

impl Default for GbtParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            learning_rate: 0.1,
            max_depth: 6,
            min_samples_leaf: 5,
            l2_regularization: 1.0,
        }
    }
}

impl GbtParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.n_estimators == 0 {
            return Err(ModelError::InvalidParams("n_estimators must be > 0".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ModelError::InvalidParams(
                "learning_rate must be a positive finite number".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(ModelError::InvalidParams("max_depth must be > 0".to_string()));
        }
        if self.min_samples_leaf == 0 {
            return Err(ModelError::InvalidParams(
                "min_samples_leaf must be > 0".to_string(),
            ));
        }
        if !(self.l2_regularization.is_finite() && self.l2_regularization >= 0.0) {
            return Err(ModelError::InvalidParams(
                "l2_regularization must be a non-negative finite number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid boosting parameters: {0}")]
    InvalidParams(String),
    #[error("cannot fit on an empty training set")]
    EmptyTrainingSet,
    #[error("row {row} has {actual} features, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("label count {labels} does not match row count {rows}")]
    LabelCount { rows: usize, labels: usize },
    #[error("non-finite value produced during {stage}")]
    NonFinite { stage: &'static str },
    #[error("model expects {expected} features, got {actual}")]
    FeatureCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    // NaN goes left, matching the bin it lands in during fitting.
                    idx = if !(row[*feature] > *threshold) {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbtModel {
    n_features: usize,
    base_score: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

/// Per-iteration outcome of a fit with an evaluation set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitTrace {
    /// Number of trees kept (1-based best iteration).
    pub best_iteration: usize,
    pub best_eval_rmse: Option<f64>,
    pub eval_rmse: Vec<f64>,
    pub stopped_early: bool,
}

/// Evaluation data watched for early stopping.
pub struct EvalSet<'a> {
    pub rows: &'a [Vec<f64>],
    pub labels: &'a [f64],
    pub early_stopping_rounds: Option<usize>,
}

impl GbtModel {
    pub fn fit(params: &GbtParams, rows: &[Vec<f64>], labels: &[f64]) -> Result<Self, ModelError> {
        Self::fit_with_eval(params, rows, labels, None).map(|(model, _)| model)
    }

    /// Fits up to `n_estimators` trees. With an eval set the model is truncated
    /// to the iteration with the lowest eval RMSE.
    pub fn fit_with_eval(
        params: &GbtParams,
        rows: &[Vec<f64>],
        labels: &[f64],
        eval: Option<EvalSet<'_>>,
    ) -> Result<(Self, FitTrace), ModelError> {
        params.validate()?;
        let n_features = check_matrix(rows, labels)?;
        if let Some(eval) = &eval {
            let eval_features = check_matrix(eval.rows, eval.labels)?;
            if eval_features != n_features {
                return Err(ModelError::FeatureCount {
                    expected: n_features,
                    actual: eval_features,
                });
            }
        }

        let base_score = labels.iter().sum::<f64>() / labels.len() as f64;
        if !base_score.is_finite() {
            return Err(ModelError::NonFinite { stage: "base score" });
        }

        let bins = BinnedMatrix::fit(rows, n_features, DEFAULT_MAX_BINS);
        let mut predictions = vec![base_score; rows.len()];
        let mut eval_predictions = eval
            .as_ref()
            .map(|eval| vec![base_score; eval.rows.len()])
            .unwrap_or_default();

        let mut model = Self {
            n_features,
            base_score,
            learning_rate: params.learning_rate,
            trees: Vec::with_capacity(params.n_estimators),
        };
        let mut trace = FitTrace {
            best_iteration: 0,
            best_eval_rmse: None,
            eval_rmse: Vec::new(),
            stopped_early: false,
        };
        let all_rows: Vec<usize> = (0..rows.len()).collect();

        for iteration in 0..params.n_estimators {
            let residuals: Vec<f64> = labels
                .iter()
                .zip(&predictions)
                .map(|(label, prediction)| label - prediction)
                .collect();

            let mut builder = TreeBuilder {
                params,
                bins: &bins,
                residuals: &residuals,
                nodes: Vec::new(),
            };
            builder.grow(all_rows.clone(), 0);
            let tree = RegressionTree {
                nodes: builder.nodes,
            };

            for (idx, row) in rows.iter().enumerate() {
                predictions[idx] += params.learning_rate * tree.predict(row);
            }
            if predictions.iter().any(|p| !p.is_finite()) {
                return Err(ModelError::NonFinite { stage: "boosting" });
            }

            if let Some(eval) = &eval {
                for (idx, row) in eval.rows.iter().enumerate() {
                    eval_predictions[idx] += params.learning_rate * tree.predict(row);
                }
                let rmse = rmse(&eval_predictions, eval.labels);
                if !rmse.is_finite() {
                    return Err(ModelError::NonFinite { stage: "evaluation" });
                }
                trace.eval_rmse.push(rmse);
                let improved = trace.best_eval_rmse.map_or(true, |best| rmse < best);
                if improved {
                    trace.best_eval_rmse = Some(rmse);
                    trace.best_iteration = iteration + 1;
                }
            }

            model.trees.push(tree);

            if let Some(rounds) = eval.as_ref().and_then(|eval| eval.early_stopping_rounds) {
                if iteration + 1 - trace.best_iteration >= rounds {
                    trace.stopped_early = iteration + 1 < params.n_estimators;
                    break;
                }
            }
        }

        if eval.is_some() {
            model.trees.truncate(trace.best_iteration);
        } else {
            trace.best_iteration = model.trees.len();
        }

        Ok((model, trace))
    }

    pub fn predict(&self, row: &[f64]) -> Result<f64, ModelError> {
        if row.len() != self.n_features {
            return Err(ModelError::FeatureCount {
                expected: self.n_features,
                actual: row.len(),
            });
        }
        let value = self.base_score
            + self
                .trees
                .iter()
                .map(|tree| self.learning_rate * tree.predict(row))
                .sum::<f64>();
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ModelError::NonFinite { stage: "prediction" })
        }
    }

    pub fn predict_many(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        rows.iter().map(|row| self.predict(row)).collect()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

pub fn rmse(predictions: &[f64], labels: &[f64]) -> f64 {
    if labels.is_empty() {
        return f64::NAN;
    }
    let sse = predictions
        .iter()
        .zip(labels)
        .map(|(p, y)| (p - y) * (p - y))
        .sum::<f64>();
    (sse / labels.len() as f64).sqrt()
}

pub fn mae(predictions: &[f64], labels: &[f64]) -> f64 {
    if labels.is_empty() {
        return f64::NAN;
    }
    predictions
        .iter()
        .zip(labels)
        .map(|(p, y)| (p - y).abs())
        .sum::<f64>()
        / labels.len() as f64
}

fn check_matrix(rows: &[Vec<f64>], labels: &[f64]) -> Result<usize, ModelError> {
    if rows.is_empty() {
        return Err(ModelError::EmptyTrainingSet);
    }
    if rows.len() != labels.len() {
        return Err(ModelError::LabelCount {
            rows: rows.len(),
            labels: labels.len(),
        });
    }
    let expected = rows[0].len();
    for (row, values) in rows.iter().enumerate() {
        if values.len() != expected {
            return Err(ModelError::RaggedRows {
                row,
                expected,
                actual: values.len(),
            });
        }
    }
    Ok(expected)
}

/// Column-major bin indices plus the upper edge of every bin but the last.
struct BinnedMatrix {
    bins: Vec<Vec<u8>>,
    edges: Vec<Vec<f64>>,
}

impl BinnedMatrix {
    fn fit(rows: &[Vec<f64>], n_features: usize, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, u8::MAX as usize + 1);
        let mut bins = Vec::with_capacity(n_features);
        let mut edges = Vec::with_capacity(n_features);

        for feature in 0..n_features {
            let mut values: Vec<f64> = rows
                .iter()
                .map(|row| row[feature])
                .filter(|v| !v.is_nan())
                .collect();
            values.sort_by(f64::total_cmp);
            values.dedup();

            let feature_edges: Vec<f64> = if values.len() <= max_bins {
                values.windows(2).map(|pair| (pair[0] + pair[1]) / 2.0).collect()
            } else {
                let mut cut = Vec::with_capacity(max_bins - 1);
                for q in 1..max_bins {
                    let pos = q * (values.len() - 1) / max_bins;
                    let edge = (values[pos] + values[pos + 1]) / 2.0;
                    if cut.last().map_or(true, |last| edge > *last) {
                        cut.push(edge);
                    }
                }
                cut
            };

            // bin(v) = number of edges strictly below v, so v <= edges[b] <=> bin(v) <= b.
            let column = rows
                .iter()
                .map(|row| feature_edges.partition_point(|edge| *edge < row[feature]) as u8)
                .collect();
            bins.push(column);
            edges.push(feature_edges);
        }

        Self { bins, edges }
    }
}

struct TreeBuilder<'a> {
    params: &'a GbtParams,
    bins: &'a BinnedMatrix,
    residuals: &'a [f64],
    nodes: Vec<TreeNode>,
}

struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

impl TreeBuilder<'_> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let lambda = self.params.l2_regularization;
        let sum: f64 = rows.iter().map(|idx| self.residuals[*idx]).sum();
        let count = rows.len() as f64;
        let leaf_value = sum / (count + lambda).max(f64::MIN_POSITIVE);

        let node_idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { value: leaf_value });

        if depth >= self.params.max_depth || rows.len() < 2 * self.params.min_samples_leaf {
            return node_idx;
        }
        let Some(split) = self.best_split(&rows, sum, lambda) else {
            return node_idx;
        };

        let column = &self.bins.bins[split.feature];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|idx| column[*idx] as usize <= split.bin);
        let threshold = self.bins.edges[split.feature][split.bin];

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[node_idx] = TreeNode::Split {
            feature: split.feature,
            threshold,
            left,
            right,
        };
        node_idx
    }

    fn best_split(&self, rows: &[usize], total_sum: f64, lambda: f64) -> Option<SplitCandidate> {
        let total_count = rows.len();
        let parent_score = total_sum * total_sum / (total_count as f64 + lambda);
        let min_leaf = self.params.min_samples_leaf;
        let mut best: Option<SplitCandidate> = None;

        for (feature, edges) in self.bins.edges.iter().enumerate() {
            if edges.is_empty() {
                continue;
            }
            let column = &self.bins.bins[feature];
            let mut counts = vec![0usize; edges.len() + 1];
            let mut sums = vec![0.0f64; edges.len() + 1];
            for idx in rows {
                let bin = column[*idx] as usize;
                counts[bin] += 1;
                sums[bin] += self.residuals[*idx];
            }

            let mut left_count = 0usize;
            let mut left_sum = 0.0f64;
            for bin in 0..edges.len() {
                left_count += counts[bin];
                left_sum += sums[bin];
                let right_count = total_count - left_count;
                if left_count < min_leaf {
                    continue;
                }
                if right_count < min_leaf {
                    break;
                }
                let right_sum = total_sum - left_sum;
                let gain = left_sum * left_sum / (left_count as f64 + lambda)
                    + right_sum * right_sum / (right_count as f64 + lambda)
                    - parent_score;
                if gain > MIN_SPLIT_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate { feature, bin, gain });
                }
            }
        }

        best
    }
}
