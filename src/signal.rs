//! Latest-row inference and directional signals.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{latest_feature_vector, EnrichedRow};
use crate::market::Asset;
use crate::model::{ModelEngine, ModelError};
use crate::validation::Metrics;

pub const BULLISH_THRESHOLD: f64 = 0.55;
pub const BEARISH_THRESHOLD: f64 = 0.45;
pub const HORIZON_DAYS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Bullish,
    Bearish,
    Neutral,
}

impl Signal {
    /// Strict comparisons: exactly 0.55 or 0.45 stays neutral.
    pub fn from_probability(probability_up: f64) -> Self {
        if probability_up > BULLISH_THRESHOLD {
            Self::Bullish
        } else if probability_up < BEARISH_THRESHOLD {
            Self::Bearish
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn confidence_score(probability_up: f64) -> f64 {
    ((probability_up - 0.5).abs() * 2.0).clamp(0.0, 1.0)
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no enriched rows to infer from")]
    NoRows,
    #[error("latest row is missing features: {}", missing.join(", "))]
    Blocked { missing: Vec<&'static str> },
    #[error("model produced a non-finite probability ({0})")]
    NonFiniteProbability(f64),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// One forecast, fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    asset: String,
    as_of_ts_ms_utc: i64,
    model_name: String,
    horizon_days: u32,
    probability_up: f64,
    signal: Signal,
    confidence_score: f64,
    supporting_metrics: Metrics,
}

impl Prediction {
    pub fn new(
        asset: impl Into<String>,
        as_of_ts_ms_utc: i64,
        model_name: impl Into<String>,
        probability_up: f64,
        supporting_metrics: Metrics,
    ) -> Self {
        Self {
            asset: asset.into(),
            as_of_ts_ms_utc,
            model_name: model_name.into(),
            horizon_days: HORIZON_DAYS,
            probability_up,
            signal: Signal::from_probability(probability_up),
            confidence_score: confidence_score(probability_up),
            supporting_metrics,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn as_of_ts_ms_utc(&self) -> i64 {
        self.as_of_ts_ms_utc
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn horizon_days(&self) -> u32 {
        self.horizon_days
    }

    pub fn probability_up(&self) -> f64 {
        self.probability_up
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub fn confidence_score(&self) -> f64 {
        self.confidence_score
    }

    pub fn supporting_metrics(&self) -> &Metrics {
        &self.supporting_metrics
    }
}

/// Scores the most recent enriched row with a trained engine. A row with any
/// undefined feature blocks inference instead of being imputed.
pub fn infer_latest(
    engine: &ModelEngine,
    rows: &[EnrichedRow],
    asset: &Asset,
    metrics: Metrics,
) -> Result<Prediction, InferenceError> {
    if rows.is_empty() {
        return Err(InferenceError::NoRows);
    }
    let (as_of, features) = match latest_feature_vector(rows) {
        Ok(latest) => latest,
        Err(missing) => {
            warn!(
                component = "signal",
                event = "signal.inference.blocked",
                asset = %asset.symbol,
                missing = ?missing
            );
            return Err(InferenceError::Blocked { missing });
        }
    };

    let probabilities = engine.predict_proba(&[features])?;
    let probability_up = probabilities
        .first()
        .map(|row| row[1])
        .ok_or(InferenceError::NoRows)?;
    if !probability_up.is_finite() {
        warn!(
            component = "signal",
            event = "signal.inference.non_finite",
            asset = %asset.symbol,
            probability_up
        );
        return Err(InferenceError::NonFiniteProbability(probability_up));
    }

    let prediction = Prediction::new(
        asset.symbol.clone(),
        as_of,
        engine.model_name(),
        probability_up,
        metrics,
    );

    info!(
        component = "signal",
        event = "signal.prediction",
        asset = %asset.symbol,
        model = engine.model_name(),
        probability_up,
        signal = prediction.signal().as_str(),
        confidence = prediction.confidence_score()
    );
    Ok(prediction)
}
