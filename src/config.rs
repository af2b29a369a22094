//! JSON pipeline configuration, validated once at load time.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::features::{
    validate_config, CalendarField, FeatureError, FeatureTransformConfig, GapPolicy,
    FEATURE_SCHEMA_VERSION,
};
use crate::ingest::CleaningConfig;
use crate::series::{format_ts, is_on_grid, parse_duration_ms, parse_timestamp_ms, HOUR_MS};
use crate::trainer::{validate_strategy, SearchSpace, TrainError, ValidationStrategy};
use crate::walk_forward::InsufficientHistoryAction;

pub const ENV_CONFIG_PATH: &str = "LAGCAST_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline_runner: RunnerSection,
    pub data_manager: DataManagerSection,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub features: FeaturesSection,
    #[serde(default)]
    pub training: TrainingSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSection {
    #[serde(deserialize_with = "de_timestamp_ms")]
    pub first_timestamp: i64,
    #[serde(rename = "time_increment", deserialize_with = "de_duration_ms")]
    pub time_increment_ms: i64,
    pub num_timestamps: usize,
    #[serde(default)]
    pub on_insufficient_history: InsufficientHistoryAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataManagerSection {
    pub raw_data_path: PathBuf,
    pub real_time_data_path: PathBuf,
    pub prod_database_path: PathBuf,
    pub model_dir: PathBuf,
    #[serde(default)]
    pub comparison_output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeaturesSection {
    pub lags: Vec<u32>,
    pub calendar_fields: Vec<CalendarField>,
    pub exogenous_columns: Vec<String>,
    /// Observations fetched per inference call.
    pub lookback_length: usize,
    pub gap_policy: GapPolicy,
    pub timezone: String,
    #[serde(rename = "step", deserialize_with = "de_duration_ms")]
    pub step_ms: i64,
}

impl Default for FeaturesSection {
    fn default() -> Self {
        let transform = FeatureTransformConfig::default();
        Self {
            lookback_length: transform.max_lag(),
            lags: transform.lags,
            calendar_fields: transform.calendar_fields,
            exogenous_columns: transform.exogenous_columns,
            gap_policy: transform.gap_policy,
            timezone: transform.timezone,
            step_ms: HOUR_MS,
        }
    }
}

impl FeaturesSection {
    pub fn transform_config(&self) -> FeatureTransformConfig {
        FeatureTransformConfig {
            lags: self.lags.clone(),
            calendar_fields: self.calendar_fields.clone(),
            exogenous_columns: self.exogenous_columns.clone(),
            step_ms: self.step_ms,
            timezone: self.timezone.clone(),
            gap_policy: self.gap_policy,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TrainingSection {
    #[serde(flatten)]
    pub search: SearchSpace,
    #[serde(flatten)]
    pub validation: ValidationStrategy,
    /// Keys neither flattened section claimed; rejected by `validate`.
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid feature config: {0}")]
    Features(#[from] FeatureError),
    #[error("invalid training config: {0}")]
    Training(#[from] TrainError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        info!(
            component = "config",
            event = "config.load.finish",
            path = %path.display(),
            first_timestamp = %format_ts(config.pipeline_runner.first_timestamp),
            num_timestamps = config.pipeline_runner.num_timestamps,
            lookback_length = config.features.lookback_length,
            trial_budget = config.training.search.trial_budget
        );
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let transform = self.features.transform_config();
        validate_config(&transform)?;
        if !self.training.unknown.is_empty() {
            let keys: Vec<&str> = self.training.unknown.keys().map(String::as_str).collect();
            return Err(ConfigError::Invalid(format!(
                "unknown training keys: {}",
                keys.join(", ")
            )));
        }
        self.training.search.validate()?;
        validate_strategy(&self.training.validation)?;

        let max_lag = transform.max_lag();
        if self.features.lookback_length < max_lag {
            return Err(ConfigError::Invalid(format!(
                "features.lookback_length ({}) must be >= the largest lag ({max_lag})",
                self.features.lookback_length
            )));
        }

        let runner = &self.pipeline_runner;
        if !is_on_grid(runner.first_timestamp, transform.step_ms) {
            return Err(ConfigError::Invalid(format!(
                "pipeline_runner.first_timestamp {} is not on the {}ms sampling grid",
                format_ts(runner.first_timestamp),
                transform.step_ms
            )));
        }
        if runner.time_increment_ms % transform.step_ms != 0 {
            return Err(ConfigError::Invalid(format!(
                "pipeline_runner.time_increment ({}ms) must be a multiple of features.step ({}ms)",
                runner.time_increment_ms, transform.step_ms
            )));
        }
        if runner.num_timestamps == 0 {
            return Err(ConfigError::Invalid(
                "pipeline_runner.num_timestamps must be > 0".to_string(),
            ));
        }

        if self.cleaning.target_column.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "cleaning.target_column must not be empty".to_string(),
            ));
        }
        if self
            .features
            .exogenous_columns
            .iter()
            .any(|column| column == &self.cleaning.target_column)
        {
            return Err(ConfigError::Invalid(format!(
                "target column '{}' cannot also be an exogenous column",
                self.cleaning.target_column
            )));
        }


        Ok(())
    }
}

/// Config path from `LAGCAST_CONFIG`, else `config/config.json`.
pub fn config_path_from_env() -> PathBuf {
    env::var(ENV_CONFIG_PATH)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn de_duration_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration_ms(&raw)
        .ok_or_else(|| de::Error::custom(format!("invalid duration '{raw}' (expected e.g. 1h, 30m)")))
}

fn de_timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp_ms(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'")))
}
