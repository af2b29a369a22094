//! SQLite-backed production store: an append-only observations log and an
//! append-only predictions log, both keyed by timestamp.
//!
//! A single writer is assumed. Readers may open the same file concurrently;
//! the database runs in WAL mode and rows are never updated in place.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::ingest::IngestError;
use crate::series::{format_ts, Observation, PredictionRow};

pub const STORE_SCHEMA_VERSION: u32 = 1;

const META_SCHEMA_VERSION: &str = "schema_version";
const META_EXOGENOUS_COLUMNS: &str = "exogenous_columns";
const META_INITIALIZED_AT: &str = "initialized_at_ms";
const META_HISTORY_ROWS: &str = "history_rows";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTable {
    Observations,
    Predictions,
}

impl StoreTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observations => "observations",
            Self::Predictions => "predictions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializeOutcome {
    AlreadyInitialized { observations: u64 },
    Created { observations: u64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to ingest historical source: {0}")]
    Ingest(#[from] IngestError),
    #[error("production store at {path} has not been initialized")]
    NotInitialized { path: PathBuf },
    #[error("store schema version mismatch: expected {expected}, found {actual}")]
    SchemaVersionMismatch { expected: u32, actual: String },
    #[error("store exogenous columns {stored:?} differ from requested {requested:?}")]
    ExogenousColumnsMismatch {
        stored: Vec<String>,
        requested: Vec<String>,
    },
    #[error(
        "out-of-order write to {}: {} is not after last written {}",
        table.as_str(),
        format_ts(*ts_ms_utc),
        format_ts(*last_ts_ms_utc)
    )]
    OutOfOrderWrite {
        table: StoreTable,
        last_ts_ms_utc: i64,
        ts_ms_utc: i64,
    },
    #[error(
        "insufficient history before {}: need {required} observations, have {available}",
        format_ts(*end_ts_ms_utc)
    )]
    InsufficientHistory {
        end_ts_ms_utc: i64,
        required: usize,
        available: usize,
    },
    #[error("observation at {ts_ms_utc} has {actual} exogenous values, expected {expected}")]
    ExogenousArity {
        ts_ms_utc: i64,
        expected: usize,
        actual: usize,
    },
    #[error("non-finite value written to {} at {}", table.as_str(), format_ts(*ts_ms_utc))]
    NonFiniteValue { table: StoreTable, ts_ms_utc: i64 },
}

pub struct ProductionStore {
    conn: Connection,
    path: PathBuf,
    exogenous_columns: Option<Vec<String>>,
}

impl ProductionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;

        let mut store = Self {
            conn,
            path: path.to_path_buf(),
            exogenous_columns: None,
        };
        store.exogenous_columns = store.read_marker()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.exogenous_columns.is_some()
    }

    pub fn exogenous_columns(&self) -> Result<&[String], StoreError> {
        self.exogenous_columns
            .as_deref()
            .ok_or_else(|| StoreError::NotInitialized {
                path: self.path.clone(),
            })
    }

    /// Idempotent. When the schema marker is present and current this is a
    /// no-op and `load_history` is never called. Otherwise the tables are
    /// rebuilt from `load_history` and the marker is written in the same
    /// transaction, so an interrupted run leaves nothing half-initialized.
    pub fn initialize<F>(
        &mut self,
        exogenous_columns: &[String],
        load_history: F,
    ) -> Result<InitializeOutcome, StoreError>
    where
        F: FnOnce() -> Result<Vec<Observation>, StoreError>,
    {
        if let Some(stored) = &self.exogenous_columns {
            if stored.as_slice() != exogenous_columns {
                return Err(StoreError::ExogenousColumnsMismatch {
                    stored: stored.clone(),
                    requested: exogenous_columns.to_vec(),
                });
            }
            let observations = self.count(StoreTable::Observations)?;
            info!(
                component = "store",
                event = "store.initialize.skip",
                path = %self.path.display(),
                observations = observations
            );
            return Ok(InitializeOutcome::AlreadyInitialized { observations });
        }

        info!(
            component = "store",
            event = "store.initialize.start",
            path = %self.path.display()
        );

        let history = load_history()?;
        validate_history(&history, exogenous_columns.len())?;

        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "
            DROP TABLE IF EXISTS observations;
            DROP TABLE IF EXISTS predictions;
            DROP TABLE IF EXISTS store_meta;
            CREATE TABLE store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE observations (
                ts_ms_utc INTEGER NOT NULL,
                value REAL NOT NULL,
                exogenous_json TEXT NOT NULL,
                PRIMARY KEY(ts_ms_utc)
            ) WITHOUT ROWID;
            CREATE TABLE predictions (
                ts_ms_utc INTEGER NOT NULL,
                predicted_value REAL NOT NULL,
                model_fingerprint TEXT NOT NULL,
                PRIMARY KEY(ts_ms_utc)
            ) WITHOUT ROWID;
            ",
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO observations (ts_ms_utc, value, exogenous_json) VALUES (?1, ?2, ?3)",
            )?;
            for row in &history {
                stmt.execute(params![
                    row.ts_ms_utc,
                    row.value,
                    serde_json::to_string(&row.exogenous)?
                ])?;
            }

            let mut meta = tx.prepare("INSERT INTO store_meta (key, value) VALUES (?1, ?2)")?;
            meta.execute(params![
                META_EXOGENOUS_COLUMNS,
                serde_json::to_string(exogenous_columns)?
            ])?;
            meta.execute(params![
                META_INITIALIZED_AT,
                Utc::now().timestamp_millis().to_string()
            ])?;
            meta.execute(params![META_HISTORY_ROWS, history.len().to_string()])?;
            meta.execute(params![
                META_SCHEMA_VERSION,
                STORE_SCHEMA_VERSION.to_string()
            ])?;
        }
        tx.commit()?;

        self.exogenous_columns = Some(exogenous_columns.to_vec());
        let observations = history.len() as u64;
        info!(
            component = "store",
            event = "store.initialize.finish",
            path = %self.path.display(),
            observations = observations,
            first_ts_utc = ?history.first().map(|row| format_ts(row.ts_ms_utc)),
            last_ts_utc = ?history.last().map(|row| format_ts(row.ts_ms_utc))
        );
        Ok(InitializeOutcome::Created { observations })
    }

    pub fn append_observation(&mut self, row: &Observation) -> Result<(), StoreError> {
        let expected = self.exogenous_columns()?.len();
        if row.exogenous.len() != expected {
            return Err(StoreError::ExogenousArity {
                ts_ms_utc: row.ts_ms_utc,
                expected,
                actual: row.exogenous.len(),
            });
        }
        if !row.value.is_finite() || row.exogenous.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::NonFiniteValue {
                table: StoreTable::Observations,
                ts_ms_utc: row.ts_ms_utc,
            });
        }
        self.check_monotonic(StoreTable::Observations, row.ts_ms_utc)?;

        self.conn.execute(
            "INSERT INTO observations (ts_ms_utc, value, exogenous_json) VALUES (?1, ?2, ?3)",
            params![
                row.ts_ms_utc,
                row.value,
                serde_json::to_string(&row.exogenous)?
            ],
        )?;
        debug!(
            component = "store",
            event = "store.observation.appended",
            ts_utc = %format_ts(row.ts_ms_utc),
            value = row.value
        );
        Ok(())
    }

    pub fn append_prediction(&mut self, row: &PredictionRow) -> Result<(), StoreError> {
        self.exogenous_columns()?;
        if !row.predicted_value.is_finite() {
            return Err(StoreError::NonFiniteValue {
                table: StoreTable::Predictions,
                ts_ms_utc: row.ts_ms_utc,
            });
        }
        self.check_monotonic(StoreTable::Predictions, row.ts_ms_utc)?;

        self.conn.execute(
            "INSERT INTO predictions (ts_ms_utc, predicted_value, model_fingerprint) VALUES (?1, ?2, ?3)",
            params![row.ts_ms_utc, row.predicted_value, row.model_fingerprint],
        )?;
        debug!(
            component = "store",
            event = "store.prediction.appended",
            ts_utc = %format_ts(row.ts_ms_utc),
            predicted_value = row.predicted_value
        );
        Ok(())
    }

    /// The `length` most recent observations strictly before `end_ts_ms_utc`,
    /// in ascending order.
    pub fn query_window(
        &self,
        end_ts_ms_utc: i64,
        length: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        self.exogenous_columns()?;
        let mut stmt = self.conn.prepare(
            "
            SELECT ts_ms_utc, value, exogenous_json
            FROM observations
            WHERE ts_ms_utc < ?1
            ORDER BY ts_ms_utc DESC
            LIMIT ?2
            ",
        )?;
        let limit = i64::try_from(length).unwrap_or(i64::MAX);
        let mut window = collect_observations(stmt.query(params![end_ts_ms_utc, limit])?)?;

        if window.len() < length {
            return Err(StoreError::InsufficientHistory {
                end_ts_ms_utc,
                required: length,
                available: window.len(),
            });
        }
        window.reverse();
        Ok(window)
    }

    pub fn load_all_observations(&self) -> Result<Vec<Observation>, StoreError> {
        self.exogenous_columns()?;
        let mut stmt = self.conn.prepare(
            "SELECT ts_ms_utc, value, exogenous_json FROM observations ORDER BY ts_ms_utc ASC",
        )?;
        let rows = collect_observations(stmt.query([])?)?;
        Ok(rows)
    }

    pub fn load_all_predictions(&self) -> Result<Vec<PredictionRow>, StoreError> {
        self.exogenous_columns()?;
        let mut stmt = self.conn.prepare(
            "
            SELECT ts_ms_utc, predicted_value, model_fingerprint
            FROM predictions
            ORDER BY ts_ms_utc ASC
            ",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(PredictionRow {
                ts_ms_utc: row.get(0)?,
                predicted_value: row.get(1)?,
                model_fingerprint: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn last_ts(&self, table: StoreTable) -> Result<Option<i64>, StoreError> {
        self.exogenous_columns()?;
        let sql = format!("SELECT MAX(ts_ms_utc) FROM {}", table.as_str());
        let last: Option<i64> = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(last)
    }

    pub fn count(&self, table: StoreTable) -> Result<u64, StoreError> {
        self.exogenous_columns()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn check_monotonic(&self, table: StoreTable, ts_ms_utc: i64) -> Result<(), StoreError> {
        if let Some(last_ts_ms_utc) = self.last_ts(table)? {
            if ts_ms_utc <= last_ts_ms_utc {
                return Err(StoreError::OutOfOrderWrite {
                    table,
                    last_ts_ms_utc,
                    ts_ms_utc,
                });
            }
        }
        Ok(())
    }

    /// Reads the schema marker; `None` when the store was never initialized.
    fn read_marker(&self) -> Result<Option<Vec<String>>, StoreError> {
        if !table_exists(&self.conn, "store_meta")? {
            return Ok(None);
        }
        let Some(version) = meta_value(&self.conn, META_SCHEMA_VERSION)? else {
            return Ok(None);
        };
        if version != STORE_SCHEMA_VERSION.to_string() {
            return Err(StoreError::SchemaVersionMismatch {
                expected: STORE_SCHEMA_VERSION,
                actual: version,
            });
        }
        let columns = match meta_value(&self.conn, META_EXOGENOUS_COLUMNS)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        Ok(Some(columns))
    }
}

fn validate_history(history: &[Observation], exogenous: usize) -> Result<(), StoreError> {
    let mut last: Option<i64> = None;
    for row in history {
        if row.exogenous.len() != exogenous {
            return Err(StoreError::ExogenousArity {
                ts_ms_utc: row.ts_ms_utc,
                expected: exogenous,
                actual: row.exogenous.len(),
            });
        }
        if !row.value.is_finite() || row.exogenous.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::NonFiniteValue {
                table: StoreTable::Observations,
                ts_ms_utc: row.ts_ms_utc,
            });
        }
        if let Some(last_ts_ms_utc) = last {
            if row.ts_ms_utc <= last_ts_ms_utc {
                return Err(StoreError::OutOfOrderWrite {
                    table: StoreTable::Observations,
                    last_ts_ms_utc,
                    ts_ms_utc: row.ts_ms_utc,
                });
            }
        }
        last = Some(row.ts_ms_utc);
    }
    Ok(())
}

fn collect_observations(mut rows: rusqlite::Rows<'_>) -> Result<Vec<Observation>, StoreError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let exogenous_json: String = row.get(2)?;
        out.push(Observation {
            ts_ms_utc: row.get(0)?,
            value: row.get(1)?,
            exogenous: serde_json::from_str(&exogenous_json)?,
        });
    }
    Ok(out)
}

fn meta_value(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}
