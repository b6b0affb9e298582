//! Weighted binomial GLM (logit link) behind the [`WeightedRegression`] trait
//!
//! Weights are variance weights: a row with weight 2 contributes exactly as
//! two identical rows would. The fit is Newton-Raphson on the log-likelihood,
//! which for the canonical logit link coincides with IRLS.

use std::collections::BTreeSet;
use std::f64::consts::SQRT_2;

use faer::prelude::SolverCore;
use faer::{Col, Mat, Side};
use polars::prelude::*;
use serde::Serialize;
use statrs::function::erf::erfc;
use thiserror::Error;

use super::formula::Formula;
use super::table::is_numeric;

/// Two-sided 95% standard normal quantile
const Z_975: f64 = 1.959_963_984_540_054;

/// Probabilities are clamped this far from 0 and 1
const PROB_EPS: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum RegressionError {
    #[error("no complete rows with positive weight to fit")]
    EmptyData,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("design matrix is singular (collinear or constant terms)")]
    Singular,

    #[error("fit did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("column '{0}' used in the formula is not in the data")]
    MissingColumn(String),

    #[error("weight vector has {found} entries, data has {expected} rows")]
    LengthMismatch { expected: usize, found: usize },

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

/// A weighted regression fitted from a formula, a frame and per-row weights.
pub trait WeightedRegression {
    fn fit(&self, formula: &Formula, data: &DataFrame, weights: &[f64]) -> Result<RegressionResult, RegressionError>;
}

/// One row of the coefficient table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientRow {
    pub term: String,
    pub coef: f64,
    pub std_err: f64,
    pub z: f64,
    pub p_value: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

/// Fitted model summary
#[derive(Debug, Clone, Serialize)]
pub struct RegressionResult {
    pub formula: String,
    pub coefficients: Vec<CoefficientRow>,
    /// Rows used in the fit
    pub n_obs: usize,
    pub df_model: usize,
    pub df_resid: f64,
    pub log_likelihood: f64,
    pub deviance: f64,
    pub iterations: usize,
}

impl RegressionResult {
    pub fn coefficient(&self, term: &str) -> Option<&CoefficientRow> {
        self.coefficients.iter().find(|c| c.term == term)
    }
}

/// Binomial family, logit link
#[derive(Debug, Clone, Copy)]
pub struct BinomialGlm {
    pub max_iter: usize,
    /// Convergence threshold on the largest coefficient update
    pub tolerance: f64,
}

impl Default for BinomialGlm {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tolerance: 1e-8,
        }
    }
}

impl WeightedRegression for BinomialGlm {
    fn fit(&self, formula: &Formula, data: &DataFrame, weights: &[f64]) -> Result<RegressionResult, RegressionError> {
        let design = Design::build(formula, data, weights)?;
        let n = design.y.nrows();
        let p = design.names.len();

        let mut beta = Col::<f64>::zeros(p);
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iter {
            iterations += 1;
            let mu = design.fitted(&beta);
            let covariance = design.inverse_information(&mu).ok_or(RegressionError::Singular)?;

            let step = &covariance * &design.score(&mu);
            let max_step = step.norm_max();
            beta += step.as_ref();

            if !max_step.is_finite() {
                return Err(RegressionError::NotConverged { iterations });
            }
            if max_step < self.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(RegressionError::NotConverged { iterations });
        }

        let mu = design.fitted(&beta);
        let covariance = design.inverse_information(&mu).ok_or(RegressionError::Singular)?;

        let coefficients = design
            .names
            .iter()
            .enumerate()
            .map(|(j, term)| {
                let coef = beta[j];
                let std_err = covariance[(j, j)].max(0.0).sqrt();
                let z = coef / std_err;
                CoefficientRow {
                    term: term.clone(),
                    coef,
                    std_err,
                    z,
                    p_value: erfc(z.abs() / SQRT_2),
                    ci_low: coef - Z_975 * std_err,
                    ci_high: coef + Z_975 * std_err,
                }
            })
            .collect();

        let (log_likelihood, deviance) = design.log_likelihood_and_deviance(&mu);
        let df_model = p - usize::from(formula.intercept);

        tracing::debug!(formula = %formula, n_obs = n, iterations, "binomial GLM converged");

        Ok(RegressionResult {
            formula: formula.to_string(),
            coefficients,
            n_obs: n,
            df_model,
            df_resid: n as f64 - p as f64,
            log_likelihood,
            deviance,
            iterations,
        })
    }
}

/// Design matrix, response and weights over the complete rows
struct Design {
    x: Mat<f64>,
    y: Col<f64>,
    w: Col<f64>,
    names: Vec<String>,
}

enum TermValues {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl TermValues {
    fn is_present(&self, row: usize) -> bool {
        match self {
            TermValues::Numeric(values) => values[row].is_some(),
            TermValues::Categorical(values) => values[row].is_some(),
        }
    }
}

fn term_values(data: &DataFrame, name: &str) -> Result<TermValues, RegressionError> {
    let column = data
        .column(name)
        .map_err(|_| RegressionError::MissingColumn(name.to_string()))?;

    if is_numeric(column.dtype()) {
        let cast = column.cast(&DataType::Float64)?;
        let values = cast.f64()?.iter().map(|v| v.filter(|x| x.is_finite())).collect();
        Ok(TermValues::Numeric(values))
    } else {
        let cast = column.cast(&DataType::String)?;
        let values = cast.str()?.iter().map(|v| v.map(str::to_string)).collect();
        Ok(TermValues::Categorical(values))
    }
}

impl Design {
    fn build(formula: &Formula, data: &DataFrame, weights: &[f64]) -> Result<Self, RegressionError> {
        if weights.len() != data.height() {
            return Err(RegressionError::LengthMismatch {
                expected: data.height(),
                found: weights.len(),
            });
        }

        let response = match term_values(data, &formula.response)? {
            TermValues::Numeric(values) => values,
            TermValues::Categorical(_) => {
                return Err(RegressionError::InvalidResponse(format!(
                    "'{}' is not numeric",
                    formula.response
                )))
            }
        };
        let terms = formula
            .terms
            .iter()
            .map(|name| -> Result<(&str, TermValues), RegressionError> {
                Ok((name.as_str(), term_values(data, name)?))
            })
            .collect::<Result<Vec<_>, RegressionError>>()?;

        let rows: Vec<usize> = (0..data.height())
            .filter(|&i| {
                response[i].is_some()
                    && weights[i].is_finite()
                    && weights[i] > 0.0
                    && terms.iter().all(|(_, values)| values.is_present(i))
            })
            .collect();
        if rows.is_empty() {
            return Err(RegressionError::EmptyData);
        }

        let y: Vec<f64> = rows.iter().filter_map(|&i| response[i]).collect();
        if let Some(bad) = y.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(RegressionError::InvalidResponse(format!(
                "'{}' must lie in [0, 1], found {}",
                formula.response, bad
            )));
        }
        let y = Col::from_fn(y.len(), |i| y[i]);
        let w = Col::from_fn(rows.len(), |r| weights[rows[r]]);

        // Column layout: intercept, then one column per numeric term or per non-baseline level.
        let mut names = Vec::new();
        let mut builders: Vec<Box<dyn Fn(usize) -> f64 + '_>> = Vec::new();
        if formula.intercept {
            names.push("Intercept".to_string());
            builders.push(Box::new(|_| 1.0));
        }
        for (name, values) in &terms {
            match values {
                TermValues::Numeric(values) => {
                    names.push(name.to_string());
                    builders.push(Box::new(move |i| values[i].unwrap_or(f64::NAN)));
                }
                TermValues::Categorical(values) => {
                    let levels: BTreeSet<&str> = rows.iter().filter_map(|&i| values[i].as_deref()).collect();
                    // The first sorted level is the baseline; without an intercept it gets its own column.
                    let skip = usize::from(formula.intercept);
                    for level in levels.into_iter().skip(skip) {
                        names.push(format!("{}[T.{}]", name, level));
                        let level = level.to_string();
                        builders.push(Box::new(move |i| {
                            if values[i].as_deref() == Some(level.as_str()) {
                                1.0
                            } else {
                                0.0
                            }
                        }));
                    }
                }
            }
        }

        let mut x = Mat::<f64>::zeros(rows.len(), names.len());
        for (r, &i) in rows.iter().enumerate() {
            for (c, build) in builders.iter().enumerate() {
                x[(r, c)] = build(i);
            }
        }

        Ok(Self { x, y, w, names })
    }

    fn fitted(&self, beta: &Col<f64>) -> Col<f64> {
        let eta = &self.x * beta;
        Col::from_fn(eta.nrows(), |i| (1.0 / (1.0 + (-eta[i]).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS))
    }

    /// Score of the log-likelihood, `X' (w * (y - mu))`.
    fn score(&self, mu: &Col<f64>) -> Col<f64> {
        let residual = Col::from_fn(mu.nrows(), |i| self.w[i] * (self.y[i] - mu[i]));
        self.x.transpose() * &residual
    }

    /// `(X' diag(w mu (1 - mu)) X)^-1`, or `None` when the information matrix is singular.
    fn inverse_information(&self, mu: &Col<f64>) -> Option<Mat<f64>> {
        let root = Col::from_fn(mu.nrows(), |i| (self.w[i] * mu[i] * (1.0 - mu[i])).sqrt());
        let scaled = root.column_vector_as_diagonal() * &self.x;
        let information = scaled.transpose() * &scaled;
        positive_definite_inverse(&information)
    }

    fn log_likelihood_and_deviance(&self, mu: &Col<f64>) -> (f64, f64) {
        let mut log_likelihood = 0.0;
        let mut deviance = 0.0;
        for i in 0..mu.nrows() {
            let (y, w, m) = (self.y[i], self.w[i], mu[i]);
            log_likelihood += w * (y * m.ln() + (1.0 - y) * (1.0 - m).ln());
            deviance += 2.0 * w * (xlogy(y, y / m) + xlogy(1.0 - y, (1.0 - y) / (1.0 - m)));
        }
        (log_likelihood, deviance)
    }
}

#[inline]
fn xlogy(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x * y.ln()
    }
}

/// Inverse of a symmetric positive-definite matrix through its Cholesky factor.
///
/// Pivots below `1e-12` of the largest diagonal entry count as singular, so
/// collinear designs are rejected instead of producing huge variances.
fn positive_definite_inverse(a: &Mat<f64>) -> Option<Mat<f64>> {
    let p = a.nrows();
    let scale = (0..p).map(|j| a[(j, j)].abs()).fold(0.0, f64::max);
    if p == 0 || !scale.is_finite() || scale == 0.0 {
        return None;
    }

    let cholesky = a.cholesky(Side::Lower).ok()?;
    let l = cholesky.compute_l();
    if (0..p).any(|j| l[(j, j)] * l[(j, j)] <= scale * 1e-12) {
        return None;
    }
    Some(cholesky.inverse())
}
