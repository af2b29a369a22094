//! Persisted model artifact and the "latest" slot it lives in.
//!
//! The slot is a single JSON file replaced by write-to-temp, fsync, rename, so
//! a reader sees either the previous artifact or the new one, never a torn
//! write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::{assert_schema_compatible, FeatureError, FeatureSchema};
use crate::model::{GbtModel, GbtParams, ModelError};
use crate::trainer::TrainingMetrics;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const LATEST_MODEL_FILE: &str = "latest_model.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    /// Column names in the order the model consumes them.
    pub feature_names: Vec<String>,
    pub feature_schema_version: u32,
    pub feature_fingerprint: String,
    pub params: GbtParams,
    pub model: GbtModel,
    pub metrics: TrainingMetrics,
    pub trained_at_ms: i64,
    pub last_training_ts_ms_utc: i64,
}

impl ModelArtifact {
    pub fn predict(&self, values: &[f64]) -> Result<f64, ModelError> {
        self.model.predict(values)
    }

    /// Refuses a schema whose columns, version or fingerprint differ from the
    /// ones the model was trained on.
    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), ModelLoadError> {
        let actual = schema.column_names();
        if actual != self.feature_names {
            return Err(ModelLoadError::FeatureMismatch {
                expected: self.feature_names.clone(),
                actual,
            });
        }
        assert_schema_compatible(self.feature_schema_version, &self.feature_fingerprint, schema)?;
        if self.model.n_features() != actual.len() {
            return Err(ModelLoadError::Corrupt(format!(
                "model consumes {} features, artifact lists {}",
                self.model.n_features(),
                actual.len()
            )));
        }
        Ok(())
    }
}

/// Where an artifact landed and the content hash of the persisted bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub fingerprint: String,
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("no model artifact at {path}")]
    Missing { path: PathBuf },
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported artifact format version {actual}, expected {expected}")]
    FormatVersion { expected: u32, actual: u32 },
    #[error("artifact features {expected:?} do not match current features {actual:?}")]
    FeatureMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("artifact feature schema is incompatible: {0}")]
    Schema(#[from] FeatureError),
    #[error("corrupt model artifact: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ArtifactWriteError {
    #[error("failed to write model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize model artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ModelSlot {
    dir: PathBuf,
}

impl ModelSlot {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_MODEL_FILE)
    }

    pub fn save_latest(&self, artifact: &ModelArtifact) -> Result<StoredArtifact, ArtifactWriteError> {
        let bytes = serde_json::to_vec_pretty(artifact)?;
        let target = self.latest_path();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ArtifactWriteError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let tmp = self
            .dir
            .join(format!(".{LATEST_MODEL_FILE}.tmp-{}", std::process::id()));

        let written = write_synced(&tmp, &bytes).and_then(|()| fs::rename(&tmp, &target));
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(ArtifactWriteError::Io { path: tmp, source });
        }
        // Persist the rename itself; not every platform lets a directory be opened.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        info!(
            component = "artifact",
            event = "artifact.save.finish",
            path = %target.display(),
            bytes = bytes.len(),
            feature_fingerprint = artifact.feature_fingerprint
        );
        Ok(StoredArtifact {
            path: target,
            fingerprint: content_fingerprint(&bytes),
        })
    }

    pub fn load_latest(&self) -> Result<ModelArtifact, ModelLoadError> {
        self.load_latest_fingerprinted().map(|(artifact, _)| artifact)
    }

    /// Loads the latest artifact along with the hash of the bytes read.
    pub fn load_latest_fingerprinted(&self) -> Result<(ModelArtifact, String), ModelLoadError> {
        let path = self.latest_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ModelLoadError::Missing { path });
            }
            Err(source) => return Err(ModelLoadError::Io { path, source }),
        };

        let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelLoadError::FormatVersion {
                expected: ARTIFACT_FORMAT_VERSION,
                actual: artifact.format_version,
            });
        }
        if artifact.feature_names.len() != artifact.model.n_features() {
            return Err(ModelLoadError::Corrupt(format!(
                "model consumes {} features, artifact lists {}",
                artifact.model.n_features(),
                artifact.feature_names.len()
            )));
        }

        debug!(
            component = "artifact",
            event = "artifact.load.finish",
            path = %path.display(),
            trees = artifact.model.n_trees(),
            feature_fingerprint = artifact.feature_fingerprint
        );
        Ok((artifact, content_fingerprint(&bytes)))
    }
}

/// Leading 16 hex digits of the SHA-256 of the artifact file.
fn content_fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
