//! Trainable regression boundary and the default ridge model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_RIDGE_LAMBDA: f64 = 1e-3;

const MIN_SCALE: f64 = 1e-12;
const PIVOT_EPSILON: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("model has not been fitted")]
    NotFitted,
    #[error("empty training set")]
    EmptyTrainingSet,
    #[error("feature width mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{features} feature rows but {targets} targets")]
    LengthMismatch { features: usize, targets: usize },
    #[error("non-finite value in model input")]
    NonFinite,
    #[error("singular system while solving for coefficients")]
    Singular,
    #[error("invalid model parameter: {0}")]
    InvalidParameter(String),
}

/// Opaque fit/predict boundary. Feature rows are in feature-schema order.
pub trait Regressor {
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<(), ModelError>;

    /// Exactly one prediction per input row.
    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, ModelError>;

    fn is_fitted(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RidgeState {
    feature_means: Vec<f64>,
    feature_scales: Vec<f64>,
    coefficients: Vec<f64>,
    intercept: f64,
}

/// Linear least squares with an L2 penalty on standardized features.
///
/// Constant columns get a zero coefficient, so collinear or degenerate
/// features (a constant month, a flat rolling mean) never make the system
/// singular.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeRegressor {
    lambda: f64,
    state: Option<RidgeState>,
}

impl Default for RidgeRegressor {
    fn default() -> Self {
        Self {
            lambda: DEFAULT_RIDGE_LAMBDA,
            state: None,
        }
    }
}

impl RidgeRegressor {
    pub fn new(lambda: f64) -> Result<Self, ModelError> {
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(ModelError::InvalidParameter(format!(
                "ridge lambda must be finite and >= 0, got {lambda}"
            )));
        }
        Ok(Self {
            lambda,
            state: None,
        })
    }

    /// Coefficients on the original (unstandardized) feature scale.
    pub fn coefficients(&self) -> Option<Vec<f64>> {
        self.state.as_ref().map(|state| {
            state
                .coefficients
                .iter()
                .zip(&state.feature_scales)
                .map(|(beta, scale)| beta / scale)
                .collect()
        })
    }
}

impl Regressor for RidgeRegressor {
    fn fit(&mut self, features: &[Vec<f64>], targets: &[f64]) -> Result<(), ModelError> {
        if features.len() != targets.len() {
            return Err(ModelError::LengthMismatch {
                features: features.len(),
                targets: targets.len(),
            });
        }
        let Some(first) = features.first() else {
            return Err(ModelError::EmptyTrainingSet);
        };
        let width = first.len();
        check_rows(features, width)?;
        if targets.iter().any(|y| !y.is_finite()) {
            return Err(ModelError::NonFinite);
        }

        let n = features.len() as f64;
        let mut feature_means = vec![0.0; width];
        for row in features {
            for (mean, value) in feature_means.iter_mut().zip(row) {
                *mean += value / n;
            }
        }
        let mut feature_scales = vec![0.0; width];
        for row in features {
            for (j, value) in row.iter().enumerate() {
                let d = value - feature_means[j];
                feature_scales[j] += d * d / n;
            }
        }
        for scale in &mut feature_scales {
            *scale = scale.sqrt();
            if *scale < MIN_SCALE {
                *scale = 1.0;
            }
        }
        let target_mean = targets.iter().sum::<f64>() / n;

        let standardized: Vec<Vec<f64>> = features
            .iter()
            .map(|row| standardize(row, &feature_means, &feature_scales))
            .collect();

        // Normal equations (X'X + lambda*I) beta = X'y on centered data.
        let mut gram = vec![vec![0.0; width]; width];
        let mut rhs = vec![0.0; width];
        for (row, y) in standardized.iter().zip(targets) {
            let centered = y - target_mean;
            for i in 0..width {
                rhs[i] += row[i] * centered;
                for j in i..width {
                    gram[i][j] += row[i] * row[j];
                }
            }
        }
        for i in 0..width {
            for j in 0..i {
                gram[i][j] = gram[j][i];
            }
            gram[i][i] += self.lambda;
            // Constant columns are all zero after standardization.
            if gram[i][i] < PIVOT_EPSILON {
                gram[i][i] = 1.0;
            }
        }

        let coefficients = solve_linear_system(gram, rhs)?;

        self.state = Some(RidgeState {
            feature_means,
            feature_scales,
            coefficients,
            intercept: target_mean,
        });
        Ok(())
    }

    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        let state = self.state.as_ref().ok_or(ModelError::NotFitted)?;
        check_rows(features, state.coefficients.len())?;
        Ok(features
            .iter()
            .map(|row| {
                let z = standardize(row, &state.feature_means, &state.feature_scales);
                state.intercept
                    + z.iter()
                        .zip(&state.coefficients)
                        .map(|(x, beta)| x * beta)
                        .sum::<f64>()
            })
            .collect())
    }

    fn is_fitted(&self) -> bool {
        self.state.is_some()
    }
}

fn check_rows(features: &[Vec<f64>], width: usize) -> Result<(), ModelError> {
    for row in features {
        if row.len() != width {
            return Err(ModelError::DimensionMismatch {
                expected: width,
                actual: row.len(),
            });
        }
        if row.iter().any(|value| !value.is_finite()) {
            return Err(ModelError::NonFinite);
        }
    }
    Ok(())
}

fn standardize(row: &[f64], means: &[f64], scales: &[f64]) -> Vec<f64> {
    row.iter()
        .zip(means.iter().zip(scales))
        .map(|(value, (mean, scale))| (value - mean) / scale)
        .collect()
}

/// Gaussian elimination with partial pivoting.
fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ModelError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|x, y| a[*x][col].abs().total_cmp(&a[*y][col].abs()))
            .ok_or(ModelError::Singular)?;
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return Err(ModelError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
