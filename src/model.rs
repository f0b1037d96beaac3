//! Classifier pipeline with walk-forward evaluation and a full-data refit.

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::classifiers::{
    to_matrix, BoostingConfig, GradientBoosting, LogisticConfig, LogisticRegression,
    StandardScaler,
};
use crate::features::{TrainingDataset, FEATURE_COLUMNS};
use crate::validation::{fold_metrics, FoldMetrics, Metrics, TimeSeriesSplit};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model variant '{0}', expected one of: logistic, boosting")]
    UnknownVariant(String),
    #[error("cannot train on an empty dataset")]
    EmptyDataset,
    #[error("cannot have {folds} folds with only {rows} rows")]
    TooFewRows { rows: usize, folds: usize },
    #[error("walk-forward validation needs at least 2 splits, got {0}")]
    InvalidSplits(usize),
    #[error("training partition of {rows} rows contains only class {label}")]
    SingleClass { label: u8, rows: usize },
    #[error("feature width mismatch: expected {expected}, got {actual}")]
    FeatureWidth { expected: usize, actual: usize },
    #[error("{rows} feature rows but {labels} labels")]
    LabelCount { rows: usize, labels: usize },
    #[error("logistic solver failed to converge on a singular system")]
    SolverFailed,
    #[error("numeric backend failed: {0}")]
    Backend(String),
    #[error("model has not been trained")]
    NotFitted,
}

/// Closed set of supported classifiers. Both are preceded by standardization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[default]
    Logistic,
    Boosting,
}

impl ModelVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logistic => "logistic",
            Self::Boosting => "boosting",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "logistic" => Ok(Self::Logistic),
            "boosting" => Ok(Self::Boosting),
            _ => Err(ModelError::UnknownVariant(raw.to_string())),
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug)]
pub enum FittedClassifier {
    Logistic(LogisticRegression),
    Boosting(GradientBoosting),
}

impl FittedClassifier {
    fn proba_up(&self, scaled: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        match self {
            Self::Logistic(model) => Ok(model.predict_proba(scaled)),
            Self::Boosting(model) => model.predict_proba(scaled),
        }
    }
}

/// Scaler and classifier fitted on the same rows.
#[derive(Debug)]
pub struct FittedPipeline {
    scaler: StandardScaler,
    classifier: FittedClassifier,
}

impl FittedPipeline {
    pub fn fit(variant: ModelVariant, x: ArrayView2<'_, f64>, y: &[u8]) -> Result<Self, ModelError> {
        if x.nrows() != y.len() {
            return Err(ModelError::LabelCount {
                rows: x.nrows(),
                labels: y.len(),
            });
        }
        let scaler = StandardScaler::fit(x)?;
        let scaled = scaler.transform(x);
        let classifier = match variant {
            ModelVariant::Logistic => FittedClassifier::Logistic(LogisticRegression::fit(
                scaled.view(),
                y,
                &LogisticConfig::default(),
            )?),
            ModelVariant::Boosting => FittedClassifier::Boosting(GradientBoosting::fit(
                scaled.view(),
                y,
                &BoostingConfig::default(),
            )?),
        };
        Ok(Self { scaler, classifier })
    }

    pub fn proba_up(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        let expected = self.scaler.n_features();
        if x.ncols() != expected {
            return Err(ModelError::FeatureWidth {
                expected,
                actual: x.ncols(),
            });
        }
        self.classifier.proba_up(self.scaler.transform(x).view())
    }

    pub fn classifier(&self) -> &FittedClassifier {
        &self.classifier
    }
}

fn labels_from_proba(p_up: &[f64]) -> Vec<u8> {
    p_up.iter().map(|p| u8::from(*p > 0.5)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldReport {
    pub index: usize,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub metrics: FoldMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub folds: Vec<FoldReport>,
    pub metrics: Metrics,
}

/// Fits a fresh pipeline per fold on the rows before its validation block.
pub fn evaluate_walk_forward(
    variant: ModelVariant,
    x: &[Vec<f64>],
    y: &[u8],
    splitter: &TimeSeriesSplit,
) -> Result<CrossValidation, ModelError> {
    if x.len() != y.len() {
        return Err(ModelError::LabelCount {
            rows: x.len(),
            labels: y.len(),
        });
    }

    let splits = splitter.split(x.len())?;
    let matrix = to_matrix(x)?;

    let mut folds = Vec::new();
    for fold in splits {
        let train = matrix.slice(s![fold.train.clone(), ..]);
        let pipeline = FittedPipeline::fit(variant, train, &y[fold.train.clone()])?;
        let y_val = &y[fold.validation.clone()];
        let p_up = pipeline
            .proba_up(matrix.slice(s![fold.validation.clone(), ..]))?
            .to_vec();
        let metrics = fold_metrics(y_val, &labels_from_proba(&p_up), &p_up);

        debug!(
            component = "model",
            event = "model.train.fold",
            model = variant.as_str(),
            fold = fold.index,
            train_rows = fold.train.len(),
            validation_rows = fold.validation.len(),
            accuracy = metrics.accuracy,
            auc = ?metrics.auc
        );

        folds.push(FoldReport {
            index: fold.index,
            train_rows: fold.train.len(),
            validation_rows: fold.validation.len(),
            metrics,
        });
    }

    let per_fold: Vec<FoldMetrics> = folds.iter().map(|fold| fold.metrics).collect();
    Ok(CrossValidation {
        metrics: Metrics::aggregate(&per_fold),
        folds,
    })
}

pub struct ModelEngine {
    variant: ModelVariant,
    splitter: TimeSeriesSplit,
    pipeline: Option<FittedPipeline>,
    last_validation: Option<CrossValidation>,
}

impl ModelEngine {
    pub fn new(variant: ModelVariant) -> Self {
        Self {
            variant,
            splitter: TimeSeriesSplit::default(),
            pipeline: None,
            last_validation: None,
        }
    }

    /// Builds an engine from a user-supplied variant name.
    pub fn from_name(name: &str) -> Result<Self, ModelError> {
        Ok(Self::new(ModelVariant::parse(name)?))
    }

    pub fn with_splitter(mut self, splitter: TimeSeriesSplit) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn model_name(&self) -> &'static str {
        self.variant.as_str()
    }

    pub fn is_fitted(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn last_validation(&self) -> Option<&CrossValidation> {
        self.last_validation.as_ref()
    }

    /// Walk-forward evaluation followed by a refit on every row. Only the
    /// refit serves later predictions.
    pub fn train(&mut self, x: &[Vec<f64>], y: &[u8]) -> Result<Metrics, ModelError> {
        if x.is_empty() {
            return Err(ModelError::EmptyDataset);
        }

        info!(
            component = "model",
            event = "model.train.start",
            model = self.variant.as_str(),
            rows = x.len(),
            n_splits = self.splitter.n_splits
        );

        let validation = evaluate_walk_forward(self.variant, x, y, &self.splitter)?;
        self.pipeline = Some(FittedPipeline::fit(self.variant, to_matrix(x)?.view(), y)?);

        let metrics = validation.metrics;
        info!(
            component = "model",
            event = "model.train.finish",
            model = self.variant.as_str(),
            accuracy = metrics.accuracy,
            precision = metrics.precision,
            auc = metrics.auc,
            log_loss = metrics.log_loss
        );
        self.last_validation = Some(validation);
        Ok(metrics)
    }

    pub fn train_dataset(&mut self, dataset: &TrainingDataset) -> Result<Metrics, ModelError> {
        self.train(&dataset.features, &dataset.labels)
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<u8>, ModelError> {
        Ok(labels_from_proba(&self.proba_up(x)?))
    }

    /// Rows of `[p_down, p_up]`.
    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<[f64; 2]>, ModelError> {
        Ok(self
            .proba_up(x)?
            .into_iter()
            .map(|p| [1.0 - p, p])
            .collect())
    }

    fn proba_up(&self, x: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        let pipeline = self.pipeline.as_ref().ok_or(ModelError::NotFitted)?;
        if x.is_empty() {
            return Ok(Vec::new());
        }
        Ok(pipeline.proba_up(to_matrix(x)?.view())?.to_vec())
    }

    pub fn feature_names(&self) -> &'static [&'static str] {
        &FEATURE_COLUMNS
    }
}
