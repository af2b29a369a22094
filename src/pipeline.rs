//! Training and single-timestamp inference over the production store.

use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::artifact::{ArtifactWriteError, ModelArtifact, ModelLoadError, ModelSlot};
use crate::config::{ConfigError, PipelineConfig};
use crate::features::{
    build_features, build_features_at, FeatureError, FeatureTransformConfig,
    FeatureTransformReport, GapPolicy,
};
use crate::ingest::{clean_raw_table, IngestError, RawSource};
use crate::model::ModelError;
use crate::report::PlotError;
use crate::series::{format_ts, Observation, PredictionRow};
use crate::store::{InitializeOutcome, ProductionStore, StoreError};
use crate::trainer::{train, TrainError, TrainingMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    TrainingInProgress,
    /// The last training run failed; a new run may still be started.
    TrainingFailed,
    InferenceRunning,
}

impl RunnerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::TrainingInProgress => "training_in_progress",
            Self::TrainingFailed => "training_failed",
            Self::InferenceRunning => "inference_running",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error("prediction failed: {0}")]
    Predict(#[from] ModelError),
    #[error(transparent)]
    ArtifactWrite(#[from] ArtifactWriteError),
    #[error(transparent)]
    Plot(#[from] PlotError),
}

impl PipelineError {
    /// True when a target timestamp lacks enough preceding observations.
    pub fn is_insufficient_history(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::InsufficientHistory { .. })
                | Self::Feature(FeatureError::InsufficientHistory { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub store: InitializeOutcome,
    pub observations: usize,
    pub feature_rows: usize,
    pub feature_report: FeatureTransformReport,
    pub metrics: TrainingMetrics,
    pub artifact_path: PathBuf,
    pub model_fingerprint: String,
    pub elapsed_ms: u64,
}

struct LoadedModel {
    artifact: ModelArtifact,
    fingerprint: String,
}

pub struct PipelineRunner {
    config: PipelineConfig,
    transform: FeatureTransformConfig,
    source: Box<dyn RawSource>,
    store: ProductionStore,
    slot: ModelSlot,
    state: RunnerState,
    model: Option<LoadedModel>,
}

impl PipelineRunner {
    /// Opens the production store named in the config. Does not initialize it.
    pub fn new(config: PipelineConfig, source: Box<dyn RawSource>) -> Result<Self, PipelineError> {
        config.validate()?;
        let transform = config.features.transform_config();
        let store = ProductionStore::open(&config.data_manager.prod_database_path)?;
        let slot = ModelSlot::new(config.data_manager.model_dir.clone());

        Ok(Self {
            config,
            transform,
            source,
            store,
            slot,
            state: RunnerState::Idle,
            model: None,
        })
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ProductionStore {
        &self.store
    }

    pub fn model_slot(&self) -> &ModelSlot {
        &self.slot
    }

    /// Loads and cleans a raw table with the configured cleaning and feature
    /// settings.
    pub fn load_observations(&self, path: &Path) -> Result<Vec<Observation>, IngestError> {
        load_clean(self.source.as_ref(), path, &self.config, &self.transform)
    }

    /// Idempotent: seeds the store from the raw history file on first use only.
    pub fn initialize_store(&mut self) -> Result<InitializeOutcome, PipelineError> {
        let source = self.source.as_ref();
        let config = &self.config;
        let transform = &self.transform;
        let outcome = self
            .store
            .initialize(&transform.exogenous_columns, || {
                load_clean(source, &config.data_manager.raw_data_path, config, transform)
                    .map_err(StoreError::from)
            })?;
        Ok(outcome)
    }

    /// Appends an actual observation to the production store.
    pub fn append_observation(&mut self, row: &Observation) -> Result<(), PipelineError> {
        self.store.append_observation(row)?;
        Ok(())
    }

    pub fn run_training(&mut self) -> Result<TrainingReport, PipelineError> {
        self.state = RunnerState::TrainingInProgress;
        let started = Instant::now();
        info!(
            component = "pipeline",
            event = "pipeline.training.start",
            state = self.state.as_str(),
            store_path = %self.store.path().display(),
            model_dir = %self.slot.dir().display()
        );

        match self.training_steps(started) {
            Ok(report) => {
                self.state = RunnerState::Idle;
                info!(
                    component = "pipeline",
                    event = "pipeline.training.finish",
                    state = self.state.as_str(),
                    observations = report.observations,
                    feature_rows = report.feature_rows,
                    validation_rmse = report.metrics.validation_rmse,
                    validation_mae = report.metrics.validation_mae,
                    artifact_path = %report.artifact_path.display(),
                    model_fingerprint = %report.model_fingerprint,
                    elapsed_ms = report.elapsed_ms
                );
                Ok(report)
            }
            Err(err) => {
                self.state = RunnerState::TrainingFailed;
                error!(
                    component = "pipeline",
                    event = "pipeline.training.failed",
                    state = self.state.as_str(),
                    error = %err
                );
                Err(err)
            }
        }
    }

    fn training_steps(&mut self, started: Instant) -> Result<TrainingReport, PipelineError> {
        let store = self.initialize_store()?;
        let observations = self.store.load_all_observations()?;
        let (schema, rows, feature_report) = build_features(&observations, &self.transform)?;
        let (artifact, metrics) = train(
            &schema,
            &rows,
            &self.config.training.search,
            &self.config.training.validation,
        )?;
        let stored = self.slot.save_latest(&artifact)?;
        self.model = None;

        Ok(TrainingReport {
            store,
            observations: observations.len(),
            feature_rows: rows.len(),
            feature_report,
            metrics,
            artifact_path: stored.path,
            model_fingerprint: stored.fingerprint,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Predicts the target at `ts_ms_utc` from the observations strictly before
    /// it and appends the prediction. Nothing is written when any step fails.
    pub fn run_inference(&mut self, ts_ms_utc: i64) -> Result<PredictionRow, PipelineError> {
        let resting = self.state;
        self.state = RunnerState::InferenceRunning;
        let result = self.inference_steps(ts_ms_utc);
        self.state = resting;

        match &result {
            Ok(row) => debug!(
                component = "pipeline",
                event = "pipeline.inference.finish",
                ts_utc = %format_ts(ts_ms_utc),
                predicted_value = row.predicted_value,
                model_fingerprint = %row.model_fingerprint
            ),
            Err(err) => debug!(
                component = "pipeline",
                event = "pipeline.inference.failed",
                ts_utc = %format_ts(ts_ms_utc),
                error = %err
            ),
        }
        result
    }

    fn inference_steps(&mut self, ts_ms_utc: i64) -> Result<PredictionRow, PipelineError> {
        let window = self
            .store
            .query_window(ts_ms_utc, self.config.features.lookback_length)?;
        let strict = FeatureTransformConfig {
            gap_policy: GapPolicy::Strict,
            ..self.transform.clone()
        };
        let (schema, features) = build_features_at(&window, ts_ms_utc, &strict)?;

        let loaded = self.loaded_model()?;
        loaded.artifact.check_schema(&schema)?;
        let predicted_value = loaded.artifact.predict(&features.values)?;
        let row = PredictionRow {
            ts_ms_utc,
            predicted_value,
            model_fingerprint: loaded.fingerprint.clone(),
        };

        self.store.append_prediction(&row)?;
        Ok(row)
    }

    fn loaded_model(&mut self) -> Result<&LoadedModel, ModelLoadError> {
        if self.model.is_none() {
            let (artifact, fingerprint) = self.slot.load_latest_fingerprinted()?;
            info!(
                component = "pipeline",
                event = "pipeline.model.loaded",
                path = %self.slot.latest_path().display(),
                model_fingerprint = %fingerprint,
                trained_at_ms = artifact.trained_at_ms
            );
            self.model = Some(LoadedModel {
                artifact,
                fingerprint,
            });
        }
        self.model.as_ref().ok_or_else(|| ModelLoadError::Missing {
            path: self.slot.latest_path(),
        })
    }
}

fn load_clean(
    source: &dyn RawSource,
    path: &Path,
    config: &PipelineConfig,
    transform: &FeatureTransformConfig,
) -> Result<Vec<Observation>, IngestError> {
    let table = source.load_table(path)?;
    let cleaned = clean_raw_table(&table, &config.cleaning, transform)?;
    Ok(cleaned.observations)
}
