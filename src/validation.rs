//! Walk-forward splitting and classification metrics.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::classifiers::clip_probability;
use crate::model::ModelError;

pub const DEFAULT_N_SPLITS: usize = 5;

/// Expanding-window splitter: every validation block follows its training rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesSplit {
    pub n_splits: usize,
}

impl Default for TimeSeriesSplit {
    fn default() -> Self {
        Self {
            n_splits: DEFAULT_N_SPLITS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    pub train: Range<usize>,
    pub validation: Range<usize>,
}

impl TimeSeriesSplit {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }

    /// Folds over `n_rows` rows in time order. The last `n_splits` blocks of
    /// `n_rows / (n_splits + 1)` rows are validated in turn; each trains on
    /// every row before its block.
    pub fn split(&self, n_rows: usize) -> Result<Vec<Fold>, ModelError> {
        if self.n_splits < 2 {
            return Err(ModelError::InvalidSplits(self.n_splits));
        }
        let n_folds = self.n_splits + 1;
        if n_folds > n_rows {
            return Err(ModelError::TooFewRows {
                rows: n_rows,
                folds: n_folds,
            });
        }

        let test_size = n_rows / n_folds;
        let first_test_start = n_rows - self.n_splits * test_size;

        Ok((0..self.n_splits)
            .map(|index| {
                let start = first_test_start + index * test_size;
                Fold {
                    index,
                    train: 0..start,
                    validation: start..start + test_size,
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoldMetrics {
    pub accuracy: f64,
    pub precision: f64,
    /// Absent when the validation block holds a single class.
    pub auc: Option<f64>,
    pub log_loss: f64,
}

/// Cross-validated averages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub precision: f64,
    pub auc: f64,
    pub log_loss: f64,
}

impl Metrics {
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("accuracy", self.accuracy),
            ("precision", self.precision),
            ("auc", self.auc),
            ("log_loss", self.log_loss),
        ])
    }

    /// Arithmetic mean per metric over the folds that produced it; 0.0 when none did.
    pub fn aggregate(folds: &[FoldMetrics]) -> Self {
        let aucs: Vec<f64> = folds.iter().filter_map(|fold| fold.auc).collect();
        Self {
            accuracy: mean_or_zero(folds.iter().map(|fold| fold.accuracy)),
            precision: mean_or_zero(folds.iter().map(|fold| fold.precision)),
            auc: mean_or_zero(aucs.into_iter()),
            log_loss: mean_or_zero(folds.iter().map(|fold| fold.log_loss)),
        }
    }
}

fn mean_or_zero(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

pub fn fold_metrics(y_true: &[u8], y_pred: &[u8], p_up: &[f64]) -> FoldMetrics {
    FoldMetrics {
        accuracy: accuracy(y_true, y_pred),
        precision: precision(y_true, y_pred),
        auc: roc_auc(y_true, p_up),
        log_loss: log_loss(y_true, p_up),
    }
}

pub fn accuracy(y_true: &[u8], y_pred: &[u8]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Precision of the positive class; 0.0 when nothing was predicted positive.
pub fn precision(y_true: &[u8], y_pred: &[u8]) -> f64 {
    let (tp, fp) = y_true
        .iter()
        .zip(y_pred)
        .fold((0usize, 0usize), |(tp, fp), (t, p)| match (*t, *p) {
            (1, 1) => (tp + 1, fp),
            (0, 1) => (tp, fp + 1),
            _ => (tp, fp),
        });
    if tp + fp == 0 {
        0.0
    } else {
        tp as f64 / (tp + fp) as f64
    }
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
pub fn roc_auc(y_true: &[u8], scores: &[f64]) -> Option<f64> {
    let positives = y_true.iter().filter(|t| **t == 1).count();
    let negatives = y_true.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // 1-based average rank of the tie group
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }

    let positive_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(t, _)| **t == 1)
        .map(|(_, rank)| rank)
        .sum();
    let p = positives as f64;
    let u = positive_rank_sum - p * (p + 1.0) / 2.0;
    Some(u / (p * negatives as f64))
}

pub fn log_loss(y_true: &[u8], p_up: &[f64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let total: f64 = y_true
        .iter()
        .zip(p_up)
        .map(|(t, p)| {
            let p = clip_probability(*p);
            if *t == 1 {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / y_true.len() as f64
}
