//! Daily indicator engine and supervised dataset builder.
//!
//! Every feature at row `t` is computed from observations at `<= t` through a
//! bounded rolling state. The label is the only column that looks at `t + 1`
//! and is produced by a separate pass over adjacent rows.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::market::MarketDataPoint;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const VOL_SHORT_WINDOW: usize = 7;
pub const VOL_LONG_WINDOW: usize = 30;
pub const RSI_PERIOD: usize = 14;
pub const SMA_FAST_WINDOW: usize = 50;
pub const SMA_SLOW_WINDOW: usize = 200;
pub const DRAWDOWN_WINDOW: usize = 365;
pub const VOLUME_CHANGE_LAG: usize = 5;

/// RSI reported for a window with neither gains nor losses.
pub const RSI_FLAT_VALUE: f64 = 50.0;

/// Model inputs, in matrix column order. The label is deliberately absent.
pub const FEATURE_COLUMNS: [&str; 12] = [
    "price",
    "market_cap",
    "total_volume",
    "log_ret",
    "vol_7d",
    "vol_30d",
    "rsi_14",
    "sma_50",
    "sma_200",
    "trend_signal",
    "drawdown",
    "vol_change_5d",
];

pub const LABEL_COLUMN: &str = "target_next_day_up";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// One timestamp of the enriched series. `None` marks an undefined value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    pub ts_ms_utc: i64,
    pub price: f64,
    pub market_cap: f64,
    pub total_volume: f64,
    pub log_ret: Option<f64>,
    pub vol_7d: Option<f64>,
    pub vol_30d: Option<f64>,
    pub rsi_14: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub trend_signal: Option<f64>,
    pub drawdown: Option<f64>,
    pub vol_change_5d: Option<f64>,
    pub target_next_day_up: Option<f64>,
}

impl EnrichedRow {
    /// Feature values in [`FEATURE_COLUMNS`] order.
    pub fn feature_values(&self) -> [Option<f64>; 12] {
        [
            Some(self.price),
            Some(self.market_cap),
            Some(self.total_volume),
            self.log_ret,
            self.vol_7d,
            self.vol_30d,
            self.rsi_14,
            self.sma_50,
            self.sma_200,
            self.trend_signal,
            self.drawdown,
            self.vol_change_5d,
        ]
    }

    /// Complete feature vector, or `None` when any feature is undefined.
    pub fn feature_vector(&self) -> Option<Vec<f64>> {
        self.feature_values().into_iter().collect()
    }

    pub fn missing_features(&self) -> Vec<&'static str> {
        FEATURE_COLUMNS
            .iter()
            .zip(self.feature_values())
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Rows with every feature and the label defined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingDataset {
    pub timestamps: Vec<i64>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl TrainingDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PriceRolling {
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    log_rets: VecDeque<f64>,
    deltas: VecDeque<f64>,
    seen: usize,
}

impl PriceRolling {
    fn new() -> Self {
        Self {
            prices: VecDeque::with_capacity(DRAWDOWN_WINDOW + 1),
            volumes: VecDeque::with_capacity(VOLUME_CHANGE_LAG + 2),
            log_rets: VecDeque::with_capacity(VOL_LONG_WINDOW + 1),
            deltas: VecDeque::with_capacity(RSI_PERIOD + 1),
            seen: 0,
        }
    }

    fn push(&mut self, point: &MarketDataPoint) {
        if let Some(prev_price) = self.prices.back().copied() {
            // An undefined return occupies its slot so windows stay aligned to rows.
            self.log_rets.push_back((point.price / prev_price).ln());
            self.deltas.push_back(point.price - prev_price);
            trim_front(&mut self.log_rets, VOL_LONG_WINDOW);
            trim_front(&mut self.deltas, RSI_PERIOD);
        }

        self.prices.push_back(point.price);
        self.volumes.push_back(point.total_volume);
        trim_front(&mut self.prices, DRAWDOWN_WINDOW);
        trim_front(&mut self.volumes, VOLUME_CHANGE_LAG + 1);
        self.seen += 1;
    }

    fn log_ret(&self) -> Option<f64> {
        if self.seen < 2 {
            return None;
        }
        self.log_rets.back().copied().and_then(finite)
    }

    fn vol_w(&self, w: usize) -> Option<f64> {
        if w < 2 || self.seen <= w || self.log_rets.len() < w {
            return None;
        }
        let start = self.log_rets.len() - w;
        let window: Vec<f64> = self.log_rets.range(start..).copied().collect();
        if window.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let mean = window.iter().sum::<f64>() / w as f64;
        let variance = window
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / (w - 1) as f64;
        finite(variance.sqrt())
    }

    fn rsi(&self, period: usize) -> Option<f64> {
        if period == 0 || self.deltas.len() < period {
            return None;
        }
        let start = self.deltas.len() - period;
        let (gain_sum, loss_sum) = self
            .deltas
            .range(start..)
            .fold((0.0_f64, 0.0_f64), |(gain, loss), delta| {
                if *delta > 0.0 {
                    (gain + delta, loss)
                } else {
                    (gain, loss - delta)
                }
            });
        let avg_gain = gain_sum / period as f64;
        let avg_loss = loss_sum / period as f64;

        if avg_loss == 0.0 {
            return Some(if avg_gain > 0.0 { 100.0 } else { RSI_FLAT_VALUE });
        }
        let rs = avg_gain / avg_loss;
        finite(100.0 - 100.0 / (1.0 + rs))
    }

    fn sma(&self, w: usize) -> Option<f64> {
        if w == 0 || self.prices.len() < w {
            return None;
        }
        let start = self.prices.len() - w;
        let sum = self.prices.range(start..).sum::<f64>();
        finite(sum / w as f64)
    }

    fn drawdown(&self) -> Option<f64> {
        let current = *self.prices.back()?;
        let peak = self.prices.iter().copied().fold(f64::MIN, f64::max);
        finite(current / peak - 1.0)
    }

    fn volume_change(&self, lag: usize) -> Option<f64> {
        if self.volumes.len() <= lag {
            return None;
        }
        let current = *self.volumes.back()?;
        let past = self.volumes[self.volumes.len() - 1 - lag];
        finite(current / past - 1.0)
    }
}

fn trim_front(values: &mut VecDeque<f64>, max_len: usize) {
    while values.len() > max_len {
        values.pop_front();
    }
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

pub fn build_feature_schema() -> FeatureSchema {
    let columns: Vec<FeatureColumn> = FEATURE_COLUMNS
        .iter()
        .map(|name| FeatureColumn {
            name: (*name).to_string(),
            dtype: FeatureDType::F64,
        })
        .collect();
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Enriches a daily series with indicators and the next-day label.
///
/// The input is copied and sorted by timestamp; the caller's slice is untouched.
pub fn compute_features(series: &[MarketDataPoint]) -> Vec<EnrichedRow> {
    let mut sorted = series.to_vec();
    sorted.sort_by_key(|point| point.ts_ms_utc);

    let mut state = PriceRolling::new();
    let mut rows = Vec::with_capacity(sorted.len());

    for point in &sorted {
        state.push(point);

        let sma_50 = state.sma(SMA_FAST_WINDOW);
        let sma_200 = state.sma(SMA_SLOW_WINDOW);
        let trend_signal = match (sma_50, sma_200) {
            (Some(fast), Some(slow)) => Some(if fast > slow { 1.0 } else { 0.0 }),
            _ => None,
        };

        rows.push(EnrichedRow {
            ts_ms_utc: point.ts_ms_utc,
            price: point.price,
            market_cap: point.market_cap,
            total_volume: point.total_volume,
            log_ret: state.log_ret(),
            vol_7d: state.vol_w(VOL_SHORT_WINDOW),
            vol_30d: state.vol_w(VOL_LONG_WINDOW),
            rsi_14: state.rsi(RSI_PERIOD),
            sma_50,
            sma_200,
            trend_signal,
            drawdown: state.drawdown(),
            vol_change_5d: state.volume_change(VOLUME_CHANGE_LAG),
            target_next_day_up: None,
        });
    }

    attach_next_day_labels(&mut rows);

    debug!(
        component = "features",
        event = "features.compute.finish",
        input_points = series.len(),
        output_rows = rows.len()
    );

    rows
}

fn attach_next_day_labels(rows: &mut [EnrichedRow]) {
    for idx in 0..rows.len() {
        let current = rows[idx].price;
        let label = rows
            .get(idx + 1)
            .map(|next| if next.price > current { 1.0 } else { 0.0 });
        rows[idx].target_next_day_up = label;
    }
}

/// Keeps rows whose features and label are all defined. Nothing is imputed.
pub fn create_dataset(rows: &[EnrichedRow]) -> TrainingDataset {
    let mut dataset = TrainingDataset::default();

    for row in rows {
        let (Some(features), Some(label)) = (row.feature_vector(), row.target_next_day_up) else {
            continue;
        };
        dataset.timestamps.push(row.ts_ms_utc);
        dataset.features.push(features);
        dataset.labels.push(if label > 0.5 { 1 } else { 0 });
    }

    info!(
        component = "features",
        event = "features.dataset.built",
        input_rows = rows.len(),
        usable_rows = dataset.len(),
        dropped_rows = rows.len() - dataset.len()
    );

    dataset
}

/// Feature vector of the most recent row with its label stripped, or the
/// names of the features that are still undefined there.
pub fn latest_feature_vector(rows: &[EnrichedRow]) -> Result<(i64, Vec<f64>), Vec<&'static str>> {
    let Some(latest) = rows.iter().max_by_key(|row| row.ts_ms_utc) else {
        return Err(FEATURE_COLUMNS.to_vec());
    };
    match latest.feature_vector() {
        Some(values) => Ok((latest.ts_ms_utc, values)),
        None => Err(latest.missing_features()),
    }
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!(
        "windows:vol={VOL_SHORT_WINDOW},{VOL_LONG_WINDOW};rsi={RSI_PERIOD};sma={SMA_FAST_WINDOW},{SMA_SLOW_WINDOW};dd={DRAWDOWN_WINDOW};volchg={VOLUME_CHANGE_LAG};"
    ));
    hasher.update(format!("label:{LABEL_COLUMN};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(day: i64, price: f64, volume: f64) -> MarketDataPoint {
        MarketDataPoint {
            ts_ms_utc: day * 86_400_000,
            price,
            market_cap: price * 1_000.0,
            total_volume: volume,
        }
    }

    #[test]
    fn rolling_state_bounds_its_buffers() {
        let mut state = PriceRolling::new();
        for day in 0..1_000 {
            state.push(&point(day, 100.0 + day as f64, 10.0));
        }
        assert_eq!(state.prices.len(), DRAWDOWN_WINDOW);
        assert_eq!(state.log_rets.len(), VOL_LONG_WINDOW);
        assert_eq!(state.deltas.len(), RSI_PERIOD);
        assert_eq!(state.volumes.len(), VOLUME_CHANGE_LAG + 1);
    }

    #[test]
    fn rsi_matches_hand_computed_value() {
        let mut state = PriceRolling::new();
        let prices = [
            10.0, 11.0, 10.5, 11.5, 12.0, 11.0, 11.5, 12.5, 12.0, 13.0, 12.5, 13.5, 14.0, 13.0, 14.0,
        ];
        for (day, price) in prices.iter().enumerate() {
            state.push(&point(day as i64, *price, 1.0));
        }
        // gains sum to 7.5, losses to 3.5
        let expected = 100.0 - 100.0 / (1.0 + 7.5 / 3.5);
        let rsi = state.rsi(RSI_PERIOD).unwrap();
        assert!((rsi - expected).abs() < 1e-12, "rsi={rsi}");
    }

    #[test]
    fn non_positive_price_yields_undefined_return_not_infinity() {
        let rows = compute_features(&[point(0, 0.0, 1.0), point(1, 5.0, 1.0)]);
        assert_eq!(rows[1].log_ret, None);
    }

    #[test]
    fn zero_base_volume_yields_undefined_change() {
        let mut series: Vec<MarketDataPoint> = (0..7).map(|d| point(d, 10.0, 5.0)).collect();
        series[0].total_volume = 0.0;
        let rows = compute_features(&series);
        assert_eq!(rows[5].vol_change_5d, None);
        assert_eq!(rows[6].vol_change_5d, Some(0.0));
    }

    #[test]
    fn schema_fingerprint_is_stable_and_hex() {
        let a = build_feature_schema();
        let b = build_feature_schema();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);
        assert_eq!(a.columns.len(), FEATURE_COLUMNS.len());
        assert!(a.columns.iter().all(|c| c.name != LABEL_COLUMN));
    }

    #[test]
    fn latest_vector_reports_missing_features() {
        let rows = compute_features(&[point(0, 10.0, 1.0), point(1, 11.0, 1.0)]);
        let missing = latest_feature_vector(&rows).unwrap_err();
        assert!(missing.contains(&"sma_200"));
        assert!(!missing.contains(&"log_ret"));
        assert!(!missing.contains(&"price"));
    }
}
