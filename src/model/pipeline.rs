// src/model/pipeline.rs
//! The fitted scoring pipeline: median imputation, standardization and a
//! logistic model, bundled as one serializable value so inference applies
//! exactly the transforms learned at training time.
//!
//! Parameters are stored as explicit vectors (medians, means, stds, weights)
//! rather than an opaque serialized object, so the artifact has a stable
//! schema independent of any one library's internal representation. The
//! regression itself is fitted with smartcore and its coefficients are
//! extracted into [`LogisticModel`].

use anyhow::{anyhow, ensure, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::logistic_regression::{LogisticRegression, LogisticRegressionParameters};

use crate::config::FEATURE_COLS;

/// Fills NaN cells with the per-column median learned on the training set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedianImputer {
    pub medians: Vec<f64>,
}

impl MedianImputer {
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        let mut medians = Vec::with_capacity(x.ncols());
        for (j, column) in x.columns().into_iter().enumerate() {
            let mut observed: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
            ensure!(
                !observed.is_empty(),
                "Feature column '{}' has no observed values to impute from",
                FEATURE_COLS.get(j).unwrap_or(&"?")
            );
            observed.sort_by(|a, b| a.total_cmp(b));
            let mid = observed.len() / 2;
            let median = if observed.len() % 2 == 1 {
                observed[mid]
            } else {
                (observed[mid - 1] + observed[mid]) / 2.0
            };
            medians.push(median);
        }
        Ok(Self { medians })
    }

    pub fn transform(&self, x: &mut Array2<f64>) {
        for mut row in x.rows_mut() {
            for (j, value) in row.iter_mut().enumerate() {
                if !value.is_finite() {
                    *value = self.medians[j];
                }
            }
        }
    }
}

/// Zero-mean, unit-variance scaling with parameters learned on the training
/// partition only. Zero-variance columns scale by 1.0 instead of dividing
/// by zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        ensure!(x.nrows() > 0, "Cannot fit scaler on an empty matrix");
        let n = x.nrows() as f64;
        let mut means = Vec::with_capacity(x.ncols());
        let mut stds = Vec::with_capacity(x.ncols());
        for column in x.columns() {
            let mean = column.sum() / n;
            let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            means.push(mean);
            stds.push(if std > 0.0 { std } else { 1.0 });
        }
        Ok(Self { means, stds })
    }

    pub fn transform(&self, x: &mut Array2<f64>) {
        for mut row in x.rows_mut() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = (*value - self.means[j]) / self.stds[j];
            }
        }
    }
}

/// Logistic regression coefficients. Probability of the positive class is
/// sigmoid(w . x + b).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    pub fn predict_proba<'a, I>(&self, row: I) -> f64
    where
        I: IntoIterator<Item = &'a f64>,
    {
        let logit: f64 = self
            .weights
            .iter()
            .zip(row)
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.intercept;
        1.0 / (1.0 + (-logit).exp())
    }
}

/// The full fitted pipeline persisted as the model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringPipeline {
    pub features: Vec<String>,
    pub imputer: MedianImputer,
    pub scaler: StandardScaler,
    pub model: LogisticModel,
}

impl ScoringPipeline {
    /// Fits imputer, scaler and regression on the training matrix. The
    /// solver's iteration count is bounded internally by smartcore's LBFGS.
    pub fn fit(x: &Array2<f64>, y: &[i32]) -> Result<Self> {
        ensure!(x.nrows() > 0, "Cannot train on an empty feature matrix");
        ensure!(
            x.nrows() == y.len(),
            "Feature matrix has {} rows but label vector has {}",
            x.nrows(),
            y.len()
        );
        let n_features = x.ncols();

        let imputer = MedianImputer::fit(x)?;
        let mut transformed = x.clone();
        imputer.transform(&mut transformed);
        let scaler = StandardScaler::fit(&transformed)?;
        scaler.transform(&mut transformed);

        let rows: Vec<Vec<f64>> = transformed.rows().into_iter().map(|r| r.to_vec()).collect();
        let dense = DenseMatrix::from_2d_vec(&rows);
        let labels: Vec<i32> = y.to_vec();
        let fitted = LogisticRegression::fit(
            &dense,
            &labels,
            LogisticRegressionParameters::default(),
        )
        .map_err(|e| anyhow!("Logistic regression fit failed: {}", e))?;

        let coefficients = fitted.coefficients();
        let (coef_rows, coef_cols) = coefficients.shape();
        let mut weights = Vec::with_capacity(coef_rows * coef_cols);
        for i in 0..coef_rows {
            for j in 0..coef_cols {
                weights.push(*coefficients.get((i, j)));
            }
        }
        ensure!(
            weights.len() == n_features,
            "Fitted model has {} coefficients for {} features",
            weights.len(),
            n_features
        );
        let intercept = *fitted.intercept().get((0, 0));

        Ok(Self {
            features: FEATURE_COLS.iter().map(|c| c.to_string()).collect(),
            imputer,
            scaler,
            model: LogisticModel { weights, intercept },
        })
    }

    /// Scores a feature matrix: impute, scale, sigmoid. Returns P(late) per
    /// row in input order.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Vec<f64>> {
        ensure!(
            x.ncols() == self.model.weights.len(),
            "Feature matrix has {} columns but the model expects {}",
            x.ncols(),
            self.model.weights.len()
        );
        let mut transformed = x.clone();
        self.imputer.transform(&mut transformed);
        self.scaler.transform(&mut transformed);
        Ok(transformed
            .rows()
            .into_iter()
            .map(|row| self.model.predict_proba(row.iter()))
            .collect())
    }
}
