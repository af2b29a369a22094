use std::cell::Cell;

use lagcast::{
    InitializeOutcome, IngestError, Observation, PredictionRow, ProductionStore, StoreError,
    StoreTable, HOUR_MS, STORE_SCHEMA_VERSION,
};
use rusqlite::{params, Connection};
use tempfile::TempDir;

const START_TS_MS: i64 = 1_293_840_000_000; // 2011-01-01T00:00:00Z

fn history(count: usize) -> Vec<Observation> {
    (0..count)
        .map(|i| {
            Observation::with_exogenous(
                START_TS_MS + i as i64 * HOUR_MS,
                i as f64 * 1.5,
                vec![0.25 * i as f64],
            )
        })
        .collect()
}

fn exogenous() -> Vec<String> {
    vec!["temp".to_string()]
}

fn open_seeded(dir: &TempDir, count: usize) -> ProductionStore {
    let mut store = ProductionStore::open(&dir.path().join("prod").join("store.sqlite"))
        .expect("store opens");
    store
        .initialize(&exogenous(), || Ok(history(count)))
        .expect("initialize succeeds");
    store
}

fn prediction(hour: i64, value: f64) -> PredictionRow {
    PredictionRow {
        ts_ms_utc: START_TS_MS + hour * HOUR_MS,
        predicted_value: value,
        model_fingerprint: "0123456789abcdef".to_string(),
    }
}

#[test]
fn initialize_is_idempotent_and_skips_the_loader_once_marked() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("store.sqlite");

    let mut store = ProductionStore::open(&path).expect("open");
    assert!(!store.is_initialized());
    let first = store
        .initialize(&exogenous(), || Ok(history(10)))
        .expect("first initialize");
    assert_eq!(first, InitializeOutcome::Created { observations: 10 });
    drop(store);

    let calls = Cell::new(0);
    let mut reopened = ProductionStore::open(&path).expect("reopen");
    assert!(reopened.is_initialized());
    let second = reopened
        .initialize(&exogenous(), || {
            calls.set(calls.get() + 1);
            Ok(history(10))
        })
        .expect("second initialize");

    assert_eq!(second, InitializeOutcome::AlreadyInitialized { observations: 10 });
    assert_eq!(calls.get(), 0);
    assert_eq!(reopened.count(StoreTable::Observations).expect("count"), 10);
    assert_eq!(reopened.count(StoreTable::Predictions).expect("count"), 0);
    assert_eq!(reopened.exogenous_columns().expect("columns"), exogenous().as_slice());
}

#[test]
fn failed_initialize_leaves_store_unmarked() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("store.sqlite");
    let mut store = ProductionStore::open(&path).expect("open");

    let err = store
        .initialize(&exogenous(), || {
            Err(StoreError::Ingest(IngestError::MissingColumn("cnt".to_string())))
        })
        .expect_err("loader failure propagates");
    assert!(matches!(err, StoreError::Ingest(_)));
    assert!(!store.is_initialized());

    let mut unordered = history(3);
    unordered.swap(0, 2);
    let err = store
        .initialize(&exogenous(), || Ok(unordered))
        .expect_err("unordered history rejected");
    assert!(matches!(err, StoreError::OutOfOrderWrite { .. }));
    assert!(!ProductionStore::open(&path).expect("reopen").is_initialized());
}

#[test]
fn uninitialized_store_refuses_reads_and_writes() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = ProductionStore::open(&dir.path().join("store.sqlite")).expect("open");

    assert!(matches!(
        store.query_window(START_TS_MS, 1),
        Err(StoreError::NotInitialized { .. })
    ));
    assert!(matches!(
        store.append_prediction(&prediction(0, 1.0)),
        Err(StoreError::NotInitialized { .. })
    ));
}

#[test]
fn appends_are_monotonic_per_table() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = open_seeded(&dir, 5);

    let next = Observation::with_exogenous(START_TS_MS + 5 * HOUR_MS, 9.0, vec![1.0]);
    store.append_observation(&next).expect("next observation");

    let err = store
        .append_observation(&next)
        .expect_err("same timestamp rejected");
    match err {
        StoreError::OutOfOrderWrite {
            table,
            last_ts_ms_utc,
            ts_ms_utc,
        } => {
            assert_eq!(table, StoreTable::Observations);
            assert_eq!(last_ts_ms_utc, next.ts_ms_utc);
            assert_eq!(ts_ms_utc, next.ts_ms_utc);
        }
        other => panic!("expected out-of-order write, got {other:?}"),
    }

    let older = Observation::with_exogenous(START_TS_MS + 2 * HOUR_MS, 9.0, vec![1.0]);
    assert!(matches!(
        store.append_observation(&older),
        Err(StoreError::OutOfOrderWrite { .. })
    ));

    store.append_prediction(&prediction(7, 1.0)).expect("first prediction");
    store.append_prediction(&prediction(8, 2.0)).expect("second prediction");
    assert!(matches!(
        store.append_prediction(&prediction(8, 3.0)),
        Err(StoreError::OutOfOrderWrite {
            table: StoreTable::Predictions,
            ..
        })
    ));
    // Prediction and observation timelines are independent.
    store.append_prediction(&prediction(20, 4.0)).expect("later prediction");
    assert_eq!(store.count(StoreTable::Predictions).expect("count"), 3);
    assert_eq!(store.count(StoreTable::Observations).expect("count"), 6);
}

#[test]
fn malformed_rows_are_rejected_before_writing() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = open_seeded(&dir, 3);

    let wrong_arity = Observation::new(START_TS_MS + 3 * HOUR_MS, 1.0);
    assert!(matches!(
        store.append_observation(&wrong_arity),
        Err(StoreError::ExogenousArity {
            expected: 1,
            actual: 0,
            ..
        })
    ));
    assert!(matches!(
        store.append_prediction(&prediction(3, f64::INFINITY)),
        Err(StoreError::NonFiniteValue {
            table: StoreTable::Predictions,
            ..
        })
    ));
    assert_eq!(store.count(StoreTable::Observations).expect("count"), 3);
    assert_eq!(store.count(StoreTable::Predictions).expect("count"), 0);
}

#[test]
fn appended_rows_round_trip_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = open_seeded(&dir, 4);

    let extra = Observation::with_exogenous(START_TS_MS + 4 * HOUR_MS, -0.125, vec![0.5]);
    store.append_observation(&extra).expect("append");
    let predictions = vec![prediction(5, 12.75), prediction(6, -3.0)];
    for row in &predictions {
        store.append_prediction(row).expect("append prediction");
    }

    let mut expected = history(4);
    expected.push(extra);
    assert_eq!(store.load_all_observations().expect("observations"), expected);
    assert_eq!(store.load_all_predictions().expect("predictions"), predictions);
    assert_eq!(
        store.last_ts(StoreTable::Predictions).expect("last ts"),
        Some(START_TS_MS + 6 * HOUR_MS)
    );
}

#[test]
fn query_window_returns_latest_points_strictly_before_end() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_seeded(&dir, 10);

    let end = START_TS_MS + 6 * HOUR_MS;
    let window = store.query_window(end, 3).expect("window");
    let hours: Vec<i64> = window
        .iter()
        .map(|row| (row.ts_ms_utc - START_TS_MS) / HOUR_MS)
        .collect();
    assert_eq!(hours, vec![3, 4, 5]);
    assert_eq!(window, history(10)[3..6].to_vec());

    let err = store
        .query_window(START_TS_MS + 2 * HOUR_MS, 3)
        .expect_err("only two points precede the end");
    assert!(matches!(
        err,
        StoreError::InsufficientHistory {
            required: 3,
            available: 2,
            ..
        }
    ));
}

#[test]
fn unknown_schema_version_is_refused_on_open() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("store.sqlite");
    drop(open_seeded_at(&path));

    let conn = Connection::open(&path).expect("raw connection");
    conn.execute(
        "UPDATE store_meta SET value = ?1 WHERE key = 'schema_version'",
        params![(STORE_SCHEMA_VERSION + 1).to_string()],
    )
    .expect("bump version");
    drop(conn);

    let err = ProductionStore::open(&path).err().expect("open must fail");
    assert!(matches!(err, StoreError::SchemaVersionMismatch { expected, .. } if expected == STORE_SCHEMA_VERSION));
}

#[test]
fn exogenous_column_change_is_refused() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = open_seeded(&dir, 3);

    let err = store
        .initialize(&["hum".to_string()], || Ok(Vec::new()))
        .expect_err("different exogenous columns");
    assert!(matches!(err, StoreError::ExogenousColumnsMismatch { .. }));
}

fn open_seeded_at(path: &std::path::Path) -> ProductionStore {
    let mut store = ProductionStore::open(path).expect("store opens");
    store
        .initialize(&exogenous(), || Ok(history(3)))
        .expect("initialize succeeds");
    store
}
