//! Standardization and the two binary classifiers behind [`crate::ModelVariant`].

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};

use crate::model::ModelError;

const PROBA_EPS: f64 = 1e-15;

pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Packs row-major feature vectors into a matrix, rejecting ragged input.
pub fn to_matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>, ModelError> {
    let width = rows.first().map(Vec::len).ok_or(ModelError::EmptyDataset)?;
    if let Some(bad) = rows.iter().find(|row| row.len() != width) {
        return Err(ModelError::FeatureWidth {
            expected: width,
            actual: bad.len(),
        });
    }
    Array2::from_shape_vec((rows.len(), width), rows.concat())
        .map_err(|err| ModelError::Backend(err.to_string()))
}

fn check_labels(x: ArrayView2<'_, f64>, y: &[u8]) -> Result<(usize, usize), ModelError> {
    if x.nrows() == 0 {
        return Err(ModelError::EmptyDataset);
    }
    if x.nrows() != y.len() {
        return Err(ModelError::LabelCount {
            rows: x.nrows(),
            labels: y.len(),
        });
    }
    let positives = y.iter().filter(|label| **label == 1).count();
    let negatives = y.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ModelError::SingleClass {
            label: if positives == 0 { 0 } else { 1 },
            rows: y.len(),
        });
    }
    Ok((negatives, positives))
}

/// Zero-mean, unit-variance scaling with statistics from the fitting rows only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(x: ArrayView2<'_, f64>) -> Result<Self, ModelError> {
        let mean = x.mean_axis(Axis(0)).ok_or(ModelError::EmptyDataset)?;
        // Constant columns pass through centred but unscaled.
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std > 1e-12 { std } else { 1.0 });
        Ok(Self { mean, scale })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform_row(&self, row: ArrayView1<'_, f64>) -> Array1<f64> {
        (&row - &self.mean) / &self.scale
    }

    pub fn transform(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        (&x - &self.mean) / &self.scale
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticConfig {
    /// Inverse L2 regularization strength.
    pub c: f64,
    pub max_iter: usize,
    pub tol: f64,
    pub balanced_class_weight: bool,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 100,
            tol: 1e-8,
            balanced_class_weight: true,
        }
    }
}

/// L2-regularized logistic regression fitted by damped Newton iterations.
/// The intercept is not penalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    coef: Array1<f64>,
    intercept: f64,
}

/// Design matrix, targets and per-row weights for one logistic fit.
struct LogisticProblem {
    design: Array2<f64>,
    labels: Array1<f64>,
    weights: Array1<f64>,
    c: f64,
}

impl LogisticProblem {
    fn width(&self) -> usize {
        self.design.ncols() - 1
    }

    fn objective(&self, theta: &Array1<f64>) -> f64 {
        let coef = theta.slice(s![..self.width()]);
        let penalty = 0.5 * coef.dot(&coef);
        let z = self.design.dot(theta);
        let loss: f64 = z
            .iter()
            .zip(&self.labels)
            .zip(&self.weights)
            .map(|((z, label), weight)| {
                // log(1 + e^z) - y*z, computed without overflow
                let softplus = if *z > 0.0 {
                    z + (-z).exp().ln_1p()
                } else {
                    z.exp().ln_1p()
                };
                weight * (softplus - label * z)
            })
            .sum();
        penalty + self.c * loss
    }

    fn derivatives(&self, theta: &Array1<f64>) -> (Array1<f64>, Array2<f64>) {
        let width = self.width();
        let p = self.design.dot(theta).mapv(sigmoid);
        let residual = (&p - &self.labels) * &self.weights * self.c;
        let curvature = p.mapv(|p| p * (1.0 - p)) * &self.weights * self.c;

        let mut gradient = self.design.t().dot(&residual);
        let weighted = &self.design * &curvature.view().insert_axis(Axis(1));
        let mut hessian = self.design.t().dot(&weighted);

        for j in 0..width {
            gradient[j] += theta[j];
            hessian[[j, j]] += 1.0;
        }
        hessian[[width, width]] += 1e-10;
        (gradient, hessian)
    }
}

impl LogisticRegression {
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: &[u8],
        cfg: &LogisticConfig,
    ) -> Result<Self, ModelError> {
        let (negatives, positives) = check_labels(x, y)?;
        let (n_rows, width) = x.dim();
        let n = n_rows as f64;

        let labels: Array1<f64> = y.iter().map(|label| f64::from(*label)).collect();
        let weights: Array1<f64> = y
            .iter()
            .map(|label| {
                if !cfg.balanced_class_weight {
                    1.0
                } else if *label == 1 {
                    n / (2.0 * positives as f64)
                } else {
                    n / (2.0 * negatives as f64)
                }
            })
            .collect();

        // Trailing column of ones carries the intercept.
        let mut design = Array2::<f64>::ones((n_rows, width + 1));
        design.slice_mut(s![.., ..width]).assign(&x);
        let problem = LogisticProblem {
            design,
            labels,
            weights,
            c: cfg.c,
        };

        let mut theta = Array1::<f64>::zeros(width + 1);
        let mut objective = problem.objective(&theta);

        for _ in 0..cfg.max_iter {
            let (gradient, hessian) = problem.derivatives(&theta);
            let step = solve_linear_system(hessian, gradient).ok_or(ModelError::SolverFailed)?;

            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..30 {
                let candidate = &theta - &(&step * scale);
                let next = problem.objective(&candidate);
                if next <= objective {
                    objective = next;
                    accepted = Some(candidate);
                    break;
                }
                scale *= 0.5;
            }
            let Some(candidate) = accepted else {
                break;
            };

            let max_step = step.iter().fold(0.0_f64, |acc, s| acc.max((s * scale).abs()));
            theta = candidate;
            if max_step < cfg.tol {
                break;
            }
        }

        Ok(Self {
            intercept: theta[width],
            coef: theta.slice(s![..width]).to_owned(),
        })
    }

    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        x.dot(&self.coef) + self.intercept
    }

    /// Probability of the positive ("up") class per row.
    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        self.decision_function(x).mapv(sigmoid)
    }

    pub fn predict_proba_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        sigmoid(row.dot(&self.coef) + self.intercept)
    }

    pub fn coef(&self) -> &Array1<f64> {
        &self.coef
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }
}

/// Gaussian elimination with partial pivoting.
fn solve_linear_system(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-300 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }

        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut out = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail = a.slice(s![row, (row + 1)..]).dot(&out.slice(s![(row + 1)..]));
        out[row] = (b[row] - tail) / a[[row, row]];
    }
    out.iter().all(|v| v.is_finite()).then_some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostingConfig {
    pub n_estimators: usize,
    pub max_depth: u16,
    pub learning_rate: f64,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
}

impl Default for BoostingConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 3,
            learning_rate: 0.1,
            min_samples_split: 2,
            min_samples_leaf: 1,
        }
    }
}

impl BoostingConfig {
    fn tree_parameters(&self) -> DecisionTreeRegressorParameters {
        DecisionTreeRegressorParameters::default()
            .with_max_depth(self.max_depth)
            .with_min_samples_leaf(self.min_samples_leaf.max(1))
            .with_min_samples_split(self.min_samples_split.max(2))
    }
}

type RegressionTree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

fn dense_matrix(x: ArrayView2<'_, f64>) -> Result<DenseMatrix<f64>, ModelError> {
    let rows: Vec<Vec<f64>> = x.outer_iter().map(|row| row.to_vec()).collect();
    DenseMatrix::from_2d_vec(&rows).map_err(|err| ModelError::Backend(err.to_string()))
}

/// One boosting stage: a least-squares tree on the residuals whose leaf
/// outputs are replaced by Newton steps. Leaves are identified by the bits of
/// the mean residual the tree predicts for them.
#[derive(Debug)]
struct BoostingStage {
    tree: RegressionTree,
    leaf_steps: BTreeMap<u64, f64>,
}

impl BoostingStage {
    fn fit(
        matrix: &DenseMatrix<f64>,
        labels: &Array1<f64>,
        raw: &Array1<f64>,
        cfg: &BoostingConfig,
    ) -> Result<Self, ModelError> {
        let p = raw.mapv(sigmoid);
        let residuals = (labels - &p).to_vec();
        let tree = RegressionTree::fit(matrix, &residuals, cfg.tree_parameters())
            .map_err(|err| ModelError::Backend(err.to_string()))?;
        let leaf_means = tree
            .predict(matrix)
            .map_err(|err| ModelError::Backend(err.to_string()))?;

        // Newton step per leaf: sum(residual) / sum(p * (1 - p)).
        let mut sums: BTreeMap<u64, (f64, f64)> = BTreeMap::new();
        for ((leaf, residual), p) in leaf_means.iter().zip(&residuals).zip(p.iter()) {
            let entry = sums.entry(leaf.to_bits()).or_insert((0.0, 0.0));
            entry.0 += residual;
            entry.1 += p * (1.0 - p);
        }
        let leaf_steps = sums
            .into_iter()
            .map(|(leaf, (num, den))| (leaf, if den.abs() < 1e-150 { 0.0 } else { num / den }))
            .collect();

        Ok(Self { tree, leaf_steps })
    }

    fn steps(&self, matrix: &DenseMatrix<f64>) -> Result<Array1<f64>, ModelError> {
        let leaf_means = self
            .tree
            .predict(matrix)
            .map_err(|err| ModelError::Backend(err.to_string()))?;
        Ok(leaf_means
            .iter()
            .map(|leaf| self.leaf_steps.get(&leaf.to_bits()).copied().unwrap_or(0.0))
            .collect())
    }
}

/// Gradient-boosted trees on the binomial deviance.
#[derive(Debug)]
pub struct GradientBoosting {
    init_raw: f64,
    learning_rate: f64,
    stages: Vec<BoostingStage>,
}

impl GradientBoosting {
    pub fn fit(
        x: ArrayView2<'_, f64>,
        y: &[u8],
        cfg: &BoostingConfig,
    ) -> Result<Self, ModelError> {
        let (_, positives) = check_labels(x, y)?;
        let prior = positives as f64 / y.len() as f64;
        let init_raw = (prior / (1.0 - prior)).ln();
        let labels: Array1<f64> = y.iter().map(|label| f64::from(*label)).collect();

        let mut raw = Array1::from_elem(y.len(), init_raw);
        let mut stages = Vec::with_capacity(cfg.n_estimators);
        if cfg.n_estimators > 0 {
            let matrix = dense_matrix(x)?;
            for _ in 0..cfg.n_estimators {
                let stage = BoostingStage::fit(&matrix, &labels, &raw, cfg)?;
                raw.scaled_add(cfg.learning_rate, &stage.steps(&matrix)?);
                stages.push(stage);
            }
        }

        Ok(Self {
            init_raw,
            learning_rate: cfg.learning_rate,
            stages,
        })
    }

    pub fn raw_scores(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        let mut raw = Array1::from_elem(x.nrows(), self.init_raw);
        if self.stages.is_empty() || x.nrows() == 0 {
            return Ok(raw);
        }
        let matrix = dense_matrix(x)?;
        for stage in &self.stages {
            raw.scaled_add(self.learning_rate, &stage.steps(&matrix)?);
        }
        Ok(raw)
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        Ok(self.raw_scores(x)?.mapv(sigmoid))
    }

    pub fn n_stages(&self) -> usize {
        self.stages.len()
    }
}

/// Clamps a probability away from 0 and 1 for log-loss.
pub(crate) fn clip_probability(p: f64) -> f64 {
    p.clamp(PROBA_EPS, 1.0 - PROBA_EPS)
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};

    use super::*;

    fn separable() -> (Array2<f64>, Vec<u8>) {
        let x = Array2::from_shape_fn((40, 2), |(i, j)| {
            let v = i as f64;
            if j == 0 {
                v
            } else {
                (v * 0.37).sin()
            }
        });
        let y = (0..40).map(|i| u8::from(i >= 20)).collect();
        (x, y)
    }

    #[test]
    fn scaler_centres_and_scales_with_population_std() {
        let x = array![[1.0, 5.0], [3.0, 5.0]];
        let scaler = StandardScaler::fit(x.view()).unwrap();
        assert_eq!(scaler.mean(), &array![2.0, 5.0]);
        assert_eq!(scaler.scale(), &array![1.0, 1.0]);
        assert_eq!(scaler.transform_row(array![3.0, 5.0].view()), array![1.0, 0.0]);
        assert_eq!(scaler.transform(x.view()), array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn matrix_packing_rejects_ragged_and_empty_input() {
        assert!(matches!(to_matrix(&[]).unwrap_err(), ModelError::EmptyDataset));
        let err = to_matrix(&[vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert!(matches!(
            err,
            ModelError::FeatureWidth {
                expected: 2,
                actual: 1
            }
        ));
        let packed = to_matrix(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(packed, array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn linear_solver_handles_pivoting() {
        let out = solve_linear_system(array![[0.0, 2.0], [1.0, 1.0]], array![4.0, 3.0]).unwrap();
        assert!((out[0] - 1.0).abs() < 1e-12);
        assert!((out[1] - 2.0).abs() < 1e-12);
        assert!(solve_linear_system(array![[0.0]], array![1.0]).is_none());
    }

    #[test]
    fn logistic_separates_threshold_data() {
        let (x, y) = separable();
        let scaler = StandardScaler::fit(x.view()).unwrap();
        let xs = scaler.transform(x.view());
        let model = LogisticRegression::fit(xs.view(), &y, &LogisticConfig::default()).unwrap();

        assert!(model.coef()[0] > 0.0);
        assert!(model.predict_proba_row(xs.row(0)) < 0.2);
        assert!(model.predict_proba_row(xs.row(39)) > 0.8);
        let batch = model.predict_proba(xs.view());
        assert!((batch[39] - model.predict_proba_row(xs.row(39))).abs() < 1e-12);
    }

    #[test]
    fn balanced_weights_pull_intercept_toward_minority() {
        let x = Array2::<f64>::zeros((10, 1));
        let y: Vec<u8> = (0..10).map(|i| u8::from(i < 2)).collect();

        let balanced = LogisticRegression::fit(x.view(), &y, &LogisticConfig::default()).unwrap();
        let plain = LogisticRegression::fit(
            x.view(),
            &y,
            &LogisticConfig {
                balanced_class_weight: false,
                ..LogisticConfig::default()
            },
        )
        .unwrap();

        assert!((balanced.predict_proba_row(array![0.0].view()) - 0.5).abs() < 1e-6);
        assert!((plain.predict_proba_row(array![0.0].view()) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn single_class_training_is_rejected() {
        let x = array![[1.0], [2.0]];
        let err = LogisticRegression::fit(x.view(), &[1, 1], &LogisticConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::SingleClass { label: 1, rows: 2 }));
        let err = GradientBoosting::fit(x.view(), &[0, 0], &BoostingConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::SingleClass { label: 0, rows: 2 }));
        let err = GradientBoosting::fit(x.view(), &[0], &BoostingConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::LabelCount { rows: 2, labels: 1 }));
    }

    #[test]
    fn boosting_fits_training_data_and_keeps_stage_count() {
        let (x, y) = separable();
        let model = GradientBoosting::fit(x.view(), &y, &BoostingConfig::default()).unwrap();
        assert_eq!(model.n_stages(), 100);
        let p = model.predict_proba(x.view()).unwrap();
        assert!(p[2] < 0.1);
        assert!(p[37] > 0.9);

        let prior_only = GradientBoosting::fit(
            x.view(),
            &y,
            &BoostingConfig {
                n_estimators: 0,
                ..BoostingConfig::default()
            },
        )
        .unwrap();
        assert_eq!(prior_only.n_stages(), 0);
        let p = prior_only.predict_proba(x.view()).unwrap();
        assert!((p[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stumps_move_scores_in_two_steps() {
        let (x, y) = separable();
        let cfg = BoostingConfig {
            n_estimators: 1,
            max_depth: 1,
            ..BoostingConfig::default()
        };
        let model = GradientBoosting::fit(x.view(), &y, &cfg).unwrap();
        let raw = model.raw_scores(x.view()).unwrap();

        let mut distinct: Vec<f64> = raw.to_vec();
        distinct.sort_by(f64::total_cmp);
        distinct.dedup();
        assert_eq!(distinct.len(), 2);
        assert!(raw[0] < 0.0 && raw[39] > 0.0);
    }
}
