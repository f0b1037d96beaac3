//! Per-asset columnar persistence (Arrow IPC files) for raw series and
//! enriched features.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{
    assert_schema_compatible, build_feature_schema, EnrichedRow, FeatureError, FeatureSchema,
};
use crate::market::{is_valid_symbol, MarketDataPoint};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no stored {kind} data for {asset} at {path}")]
    NotFound {
        kind: &'static str,
        asset: String,
        path: PathBuf,
    },
    #[error("invalid asset key '{0}', expected [a-z0-9_-]+")]
    InvalidAssetKey(String),
    #[error("feature schema sidecar missing at {0}")]
    MissingSchema(PathBuf),
    #[error("stored features are incompatible: {0}")]
    Schema(#[from] FeatureError),
    #[error("column '{column}' in {path} is missing, mistyped or has nulls")]
    Column { column: &'static str, path: PathBuf },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keyed by asset symbol.
pub trait SeriesStore: Send {
    fn save_raw(&self, asset: &str, series: &[MarketDataPoint]) -> Result<(), StorageError>;
    fn load_raw(&self, asset: &str) -> Result<Vec<MarketDataPoint>, StorageError>;
    fn save_features(&self, asset: &str, rows: &[EnrichedRow]) -> Result<(), StorageError>;
    fn load_features(&self, asset: &str) -> Result<Vec<EnrichedRow>, StorageError>;
}

const RAW_COLUMNS: [&str; 4] = ["ts_ms_utc", "price", "market_cap", "total_volume"];

/// Nullable derived columns, in stored order after the raw ones.
const DERIVED_COLUMNS: [&str; 10] = [
    "log_ret",
    "vol_7d",
    "vol_30d",
    "rsi_14",
    "sma_50",
    "sma_200",
    "trend_signal",
    "drawdown",
    "vol_change_5d",
    "target_next_day_up",
];

/// Layout under `data_dir`:
/// `raw/<asset>.arrow`, `processed/<asset>_features.arrow`,
/// `processed/<asset>_features.schema.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrowSeriesStore {
    raw_dir: PathBuf,
    processed_dir: PathBuf,
}

impl ArrowSeriesStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            raw_dir: data_dir.join("raw"),
            processed_dir: data_dir.join("processed"),
        }
    }

    pub fn raw_path(&self, asset: &str) -> PathBuf {
        self.raw_dir.join(format!("{asset}.arrow"))
    }

    pub fn features_path(&self, asset: &str) -> PathBuf {
        self.processed_dir.join(format!("{asset}_features.arrow"))
    }

    pub fn schema_path(&self, asset: &str) -> PathBuf {
        self.processed_dir
            .join(format!("{asset}_features.schema.json"))
    }
}

impl SeriesStore for ArrowSeriesStore {
    fn save_raw(&self, asset: &str, series: &[MarketDataPoint]) -> Result<(), StorageError> {
        validate_key(asset)?;
        if series.is_empty() {
            warn!(
                component = "storage",
                event = "storage.raw.empty",
                asset,
                "no observations to save"
            );
            return Ok(());
        }

        let path = self.raw_path(asset);
        fs::create_dir_all(&self.raw_dir)?;
        write_atomic(&path, &ipc_bytes(&raw_batch(series)?)?)?;

        info!(
            component = "storage",
            event = "storage.raw.saved",
            asset,
            rows = series.len(),
            path = %path.display()
        );
        Ok(())
    }

    fn load_raw(&self, asset: &str) -> Result<Vec<MarketDataPoint>, StorageError> {
        validate_key(asset)?;
        let path = self.raw_path(asset);
        let mut series = Vec::new();
        for batch in read_batches(&path, "raw", asset)? {
            let ts = int64_column(&batch, "ts_ms_utc", &path)?;
            let price = float64_column(&batch, "price", &path, false)?;
            let market_cap = float64_column(&batch, "market_cap", &path, false)?;
            let total_volume = float64_column(&batch, "total_volume", &path, false)?;
            series.extend((0..batch.num_rows()).map(|i| MarketDataPoint {
                ts_ms_utc: ts.value(i),
                price: price.value(i),
                market_cap: market_cap.value(i),
                total_volume: total_volume.value(i),
            }));
        }
        Ok(series)
    }

    fn save_features(&self, asset: &str, rows: &[EnrichedRow]) -> Result<(), StorageError> {
        validate_key(asset)?;
        let path = self.features_path(asset);
        let schema_path = self.schema_path(asset);
        fs::create_dir_all(&self.processed_dir)?;

        let schema = build_feature_schema();
        write_atomic(&schema_path, &serde_json::to_vec_pretty(&schema)?)?;
        write_atomic(&path, &ipc_bytes(&features_batch(rows)?)?)?;

        info!(
            component = "storage",
            event = "storage.features.saved",
            asset,
            rows = rows.len(),
            schema_fingerprint = %schema.fingerprint,
            path = %path.display()
        );
        Ok(())
    }

    fn load_features(&self, asset: &str) -> Result<Vec<EnrichedRow>, StorageError> {
        validate_key(asset)?;
        let path = self.features_path(asset);
        if !path.exists() {
            return Err(StorageError::NotFound {
                kind: "feature",
                asset: asset.to_string(),
                path,
            });
        }

        let schema_path = self.schema_path(asset);
        if !schema_path.exists() {
            return Err(StorageError::MissingSchema(schema_path));
        }
        let stored: FeatureSchema = serde_json::from_slice(&fs::read(&schema_path)?)?;
        let expected = build_feature_schema();
        assert_schema_compatible(expected.version, &expected.fingerprint, &stored)?;

        let mut rows = Vec::new();
        for batch in read_batches(&path, "feature", asset)? {
            let ts = int64_column(&batch, "ts_ms_utc", &path)?;
            let price = float64_column(&batch, "price", &path, false)?;
            let market_cap = float64_column(&batch, "market_cap", &path, false)?;
            let total_volume = float64_column(&batch, "total_volume", &path, false)?;
            let derived = DERIVED_COLUMNS
                .iter()
                .map(|name| float64_column(&batch, *name, &path, true))
                .collect::<Result<Vec<_>, _>>()?;
            let value = |column: usize, i: usize| {
                let array = derived[column];
                array.is_valid(i).then(|| array.value(i))
            };

            rows.extend((0..batch.num_rows()).map(|i| EnrichedRow {
                ts_ms_utc: ts.value(i),
                price: price.value(i),
                market_cap: market_cap.value(i),
                total_volume: total_volume.value(i),
                log_ret: value(0, i),
                vol_7d: value(1, i),
                vol_30d: value(2, i),
                rsi_14: value(3, i),
                sma_50: value(4, i),
                sma_200: value(5, i),
                trend_signal: value(6, i),
                drawdown: value(7, i),
                vol_change_5d: value(8, i),
                target_next_day_up: value(9, i),
            }));
        }
        Ok(rows)
    }
}

fn validate_key(asset: &str) -> Result<(), StorageError> {
    if is_valid_symbol(asset) {
        Ok(())
    } else {
        Err(StorageError::InvalidAssetKey(asset.to_string()))
    }
}

fn raw_fields() -> Vec<Field> {
    let mut fields = vec![Field::new(RAW_COLUMNS[0], DataType::Int64, false)];
    fields.extend(
        RAW_COLUMNS[1..]
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, false)),
    );
    fields
}

fn raw_arrays(
    ts: impl Iterator<Item = i64>,
    values: impl Iterator<Item = [f64; 3]> + Clone,
) -> Vec<ArrayRef> {
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from_iter_values(ts))];
    for column in 0..3 {
        let values = values.clone().map(move |row| row[column]);
        arrays.push(Arc::new(Float64Array::from_iter_values(values)));
    }
    arrays
}

fn raw_batch(series: &[MarketDataPoint]) -> Result<RecordBatch, StorageError> {
    let arrays = raw_arrays(
        series.iter().map(|point| point.ts_ms_utc),
        series
            .iter()
            .map(|point| [point.price, point.market_cap, point.total_volume]),
    );
    Ok(RecordBatch::try_new(Arc::new(Schema::new(raw_fields())), arrays)?)
}

fn features_batch(rows: &[EnrichedRow]) -> Result<RecordBatch, StorageError> {
    let mut fields = raw_fields();
    fields.extend(
        DERIVED_COLUMNS
            .iter()
            .map(|name| Field::new(*name, DataType::Float64, true)),
    );

    let mut arrays = raw_arrays(
        rows.iter().map(|row| row.ts_ms_utc),
        rows.iter()
            .map(|row| [row.price, row.market_cap, row.total_volume]),
    );
    let derived: [fn(&EnrichedRow) -> Option<f64>; 10] = [
        |row| row.log_ret,
        |row| row.vol_7d,
        |row| row.vol_30d,
        |row| row.rsi_14,
        |row| row.sma_50,
        |row| row.sma_200,
        |row| row.trend_signal,
        |row| row.drawdown,
        |row| row.vol_change_5d,
        |row| row.target_next_day_up,
    ];
    for get in derived {
        let column: Float64Array = rows.iter().map(get).collect();
        arrays.push(Arc::new(column));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn ipc_bytes(batch: &RecordBatch) -> Result<Vec<u8>, StorageError> {
    let mut writer = FileWriter::try_new(Vec::new(), &batch.schema())?;
    writer.write(batch)?;
    writer.finish()?;
    Ok(writer.into_inner()?)
}

fn read_batches(
    path: &Path,
    kind: &'static str,
    asset: &str,
) -> Result<Vec<RecordBatch>, StorageError> {
    if !path.exists() {
        return Err(StorageError::NotFound {
            kind,
            asset: asset.to_string(),
            path: path.to_path_buf(),
        });
    }
    let reader = FileReader::try_new(fs::File::open(path)?, None)?;
    Ok(reader.collect::<Result<Vec<_>, ArrowError>>()?)
}

fn int64_column<'a>(
    batch: &'a RecordBatch,
    column: &'static str,
    path: &Path,
) -> Result<&'a Int64Array, StorageError> {
    batch
        .column_by_name(column)
        .and_then(|array| array.as_any().downcast_ref::<Int64Array>())
        .filter(|array| array.null_count() == 0)
        .ok_or_else(|| StorageError::Column {
            column,
            path: path.to_path_buf(),
        })
}

fn float64_column<'a>(
    batch: &'a RecordBatch,
    column: &'static str,
    path: &Path,
    nullable: bool,
) -> Result<&'a Float64Array, StorageError> {
    batch
        .column_by_name(column)
        .and_then(|array| array.as_any().downcast_ref::<Float64Array>())
        .filter(|array| nullable || array.null_count() == 0)
        .ok_or_else(|| StorageError::Column {
            column,
            path: path.to_path_buf(),
        })
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            ))
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::compute_features;
    use tempfile::tempdir;

    fn series(n: usize) -> Vec<MarketDataPoint> {
        (0..n)
            .map(|i| MarketDataPoint {
                ts_ms_utc: 1_704_067_200_000 + i as i64 * 86_400_000,
                price: 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1,
                market_cap: 1.0e9 + i as f64,
                total_volume: 5.0e7 + (i % 7) as f64 * 1.0e6,
            })
            .collect()
    }

    #[test]
    fn raw_series_round_trips() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        let raw = series(20);
        store.save_raw("btc", &raw).unwrap();
        assert!(store.raw_path("btc").exists());
        assert!(!dir.path().join("raw/btc.arrow.tmp").exists());
        assert_eq!(store.load_raw("btc").unwrap(), raw);
    }

    #[test]
    fn features_round_trip_with_undefined_values() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        let rows = compute_features(&series(40));
        store.save_features("eth", &rows).unwrap();

        let loaded = store.load_features("eth").unwrap();
        assert_eq!(loaded, rows);
        assert_eq!(loaded[0].log_ret, None);
        assert_eq!(loaded[39].target_next_day_up, None);
        assert!(store.schema_path("eth").exists());
    }

    #[test]
    fn stored_file_is_columnar_with_nullable_features() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        store.save_features("sol", &compute_features(&series(12))).unwrap();

        let batches = read_batches(&store.features_path("sol"), "feature", "sol").unwrap();
        let schema = batches[0].schema();
        assert_eq!(schema.fields().len(), RAW_COLUMNS.len() + DERIVED_COLUMNS.len());
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert!(!schema.field(1).is_nullable());
        assert!(schema.field_with_name("sma_200").unwrap().is_nullable());
        let sma = float64_column(&batches[0], "sma_200", Path::new("sol"), true).unwrap();
        assert_eq!(sma.null_count(), 12);
    }

    #[test]
    fn missing_files_are_not_found() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        assert!(matches!(
            store.load_raw("sol").unwrap_err(),
            StorageError::NotFound { kind: "raw", .. }
        ));
        assert!(matches!(
            store.load_features("sol").unwrap_err(),
            StorageError::NotFound { kind: "feature", .. }
        ));
    }

    #[test]
    fn empty_raw_series_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        store.save_raw("ada", &[]).unwrap();
        assert!(!store.raw_path("ada").exists());
    }

    #[test]
    fn rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        assert!(matches!(
            store.save_raw("../btc", &series(3)).unwrap_err(),
            StorageError::InvalidAssetKey(_)
        ));
    }

    #[test]
    fn garbage_file_is_an_arrow_error() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        fs::create_dir_all(dir.path().join("raw")).unwrap();
        fs::write(store.raw_path("xrp"), b"ts_ms_utc,price\n1,2\n").unwrap();
        assert!(matches!(
            store.load_raw("xrp").unwrap_err(),
            StorageError::Arrow(_)
        ));
    }

    #[test]
    fn tampered_schema_is_rejected() {
        let dir = tempdir().unwrap();
        let store = ArrowSeriesStore::new(dir.path());
        store.save_features("dot", &compute_features(&series(10))).unwrap();

        let mut schema = build_feature_schema();
        schema.fingerprint = "0".repeat(64);
        fs::write(store.schema_path("dot"), serde_json::to_vec(&schema).unwrap()).unwrap();

        assert!(matches!(
            store.load_features("dot").unwrap_err(),
            StorageError::Schema(FeatureError::SchemaFingerprintMismatch { .. })
        ));
    }
}
