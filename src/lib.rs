//! lagcast core crate.
//!
//! Hourly demand forecasting over a lagged feature table:
//! - raw table ingestion and cleaning
//! - lag and calendar feature engine shared by training and inference
//! - gradient-boosted tree model with seeded hyperparameter search
//! - append-only production store for observations and predictions
//! - pipeline runner and walk-forward driver

mod artifact;
mod config;
mod features;
mod ingest;
mod model;
mod observability;
mod pipeline;
mod report;
mod series;
mod store;
mod trainer;
mod walk_forward;

pub use artifact::{
    ArtifactWriteError, ModelArtifact, ModelLoadError, ModelSlot, StoredArtifact,
    ARTIFACT_FORMAT_VERSION, LATEST_MODEL_FILE,
};
pub use config::{
    config_path_from_env, ConfigError, DataManagerSection, FeaturesSection, PipelineConfig,
    RunnerSection, TrainingSection, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, build_features, build_features_at,
    validate_config, CalendarField, FeatureColumn, FeatureDType, FeatureError, FeatureRow,
    FeatureSchema, FeatureTransformConfig, FeatureTransformReport, GapPolicy,
    FEATURE_SCHEMA_VERSION,
};
pub use ingest::{
    clean_raw_table, CleanedData, CleaningConfig, CleaningReport, CsvRawSource, GapFillPolicy,
    InMemoryRawSource, IngestError, MissingExogenousPolicy, MissingTargetPolicy, RawSource,
    RawTable, TimestampSource,
};
pub use model::{mae, rmse, EvalSet, FitTrace, GbtModel, GbtParams, ModelError};
pub use observability::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError, RunMode,
};
pub use pipeline::{PipelineError, PipelineRunner, RunnerState, TrainingReport};
pub use report::{
    align_predictions_with_actuals, comparison_points, ComparisonPoint, CsvComparisonPlotter,
    PlotError, Plotter,
};
pub use series::{
    format_ts, is_on_grid, parse_duration_ms, parse_timestamp_ms, Observation, PredictionRow,
    HOUR_MS,
};
pub use store::{InitializeOutcome, ProductionStore, StoreError, StoreTable, STORE_SCHEMA_VERSION};
pub use trainer::{
    train, FloatRange, IntRange, SearchSpace, TrainError, TrainingMetrics, TrialOutcome,
    ValidationStrategy,
};
pub use walk_forward::{
    run_walk_forward, InsufficientHistoryAction, WalkForwardPlan, WalkForwardSummary,
};
