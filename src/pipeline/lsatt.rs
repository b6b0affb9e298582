//! Local sample average treatment effect on the treated (LSATT)
//!
//! Weighted outcome summaries per treatment level on the matched sample,
//! compared with a Welch unequal-variance two-sample t-test.

use polars::prelude::*;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use super::table::{numeric_values, TreatmentLevels};
use crate::error::{CemError, Result};

/// Weighted outcome summary for one treatment level
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelSummary {
    pub level: f64,
    pub total_weight: f64,
    pub weighted_mean: f64,
    /// sqrt(sum w (y - unweighted mean)^2 / sum w)
    pub weighted_std: f64,
    pub count: usize,
}

/// Welch two-sample t-test on summary statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WelchTest {
    pub statistic: f64,
    pub p_value: f64,
    pub df: f64,
}

impl WelchTest {
    /// Compare `(mean, std, n)` of the first sample against the second.
    ///
    /// A zero standard error gives a NaN statistic and p-value.
    pub fn from_stats(first: (f64, f64, usize), second: (f64, f64, usize)) -> Self {
        let (m1, s1, n1) = first;
        let (m2, s2, n2) = second;
        let v1 = s1 * s1 / n1 as f64;
        let v2 = s2 * s2 / n2 as f64;

        let df = (v1 + v2).powi(2) / (v1 * v1 / (n1 as f64 - 1.0) + v2 * v2 / (n2 as f64 - 1.0));
        let se = (v1 + v2).sqrt();
        if se == 0.0 || !se.is_finite() {
            return Self {
                statistic: f64::NAN,
                p_value: f64::NAN,
                df,
            };
        }

        let statistic = (m1 - m2) / se;
        let p_value = match StudentsT::new(0.0, 1.0, df) {
            Ok(dist) => 2.0 * (1.0 - dist.cdf(statistic.abs())),
            Err(_) => f64::NAN,
        };
        Self {
            statistic,
            p_value,
            df,
        }
    }
}

/// Per-level summaries (ascending levels) and the test of the lower level against the higher
#[derive(Debug, Clone, Serialize)]
pub struct LsattResult {
    pub levels: Vec<LevelSummary>,
    pub test: WelchTest,
}

impl LsattResult {
    /// Weighted mean of the higher level minus the lower one.
    pub fn effect(&self) -> f64 {
        match self.levels.as_slice() {
            [low, high] => high.weighted_mean - low.weighted_mean,
            _ => f64::NAN,
        }
    }
}

/// Weighted effect estimate on the rows with positive weight.
///
/// Only dichotomous treatments are supported. Rows with a missing treatment
/// or outcome are skipped.
pub fn lsatt(df: &DataFrame, treatment: &str, outcome: &str, weights: &[f64]) -> Result<LsattResult> {
    if weights.len() != df.height() {
        return Err(CemError::Precondition(format!(
            "weight vector has {} entries but the frame has {} rows",
            weights.len(),
            df.height()
        )));
    }

    let y = numeric_values(df, outcome)?;
    let all_levels = TreatmentLevels::from_frame(df, treatment)?;

    let kept: Vec<usize> = (0..df.height())
        .filter(|&i| weights[i] > 0.0 && y[i].is_some() && all_levels.codes[i].is_some())
        .collect();
    let treatment_values: Vec<Option<f64>> = kept
        .iter()
        .map(|&i| all_levels.codes[i].map(|c| all_levels.levels[c]))
        .collect();
    let levels = TreatmentLevels::from_values(&treatment_values);

    match levels.len() {
        2 => {}
        n if n > 2 => {
            return Err(CemError::NotImplemented(format!(
                "LSATT for {} treatment levels; only dichotomous treatments are supported",
                n
            )))
        }
        n => {
            return Err(CemError::InsufficientLevels {
                column: treatment.to_string(),
                found: n,
                required: 2,
            })
        }
    }

    let mut summaries = Vec::with_capacity(2);
    for (code, &level) in levels.levels.iter().enumerate() {
        let group: Vec<(f64, f64)> = kept
            .iter()
            .zip(&levels.codes)
            .filter(|(_, c)| **c == Some(code))
            .filter_map(|(&i, _)| y[i].map(|v| (v, weights[i])))
            .collect();

        let count = group.len();
        let total_weight: f64 = group.iter().map(|(_, w)| w).sum();
        let weighted_mean = group.iter().map(|(v, w)| v * w).sum::<f64>() / total_weight;
        let mean = group.iter().map(|(v, _)| v).sum::<f64>() / count as f64;
        let weighted_ss: f64 = group.iter().map(|(v, w)| w * (v - mean).powi(2)).sum();

        summaries.push(LevelSummary {
            level,
            total_weight,
            weighted_mean,
            weighted_std: (weighted_ss / total_weight).sqrt(),
            count,
        });
    }

    let (low, high) = (summaries[0], summaries[1]);
    let test = WelchTest::from_stats(
        (low.weighted_mean, low.weighted_std, low.count),
        (high.weighted_mean, high.weighted_std, high.count),
    );

    tracing::debug!(
        statistic = test.statistic,
        p_value = test.p_value,
        effect = high.weighted_mean - low.weighted_mean,
        "LSATT"
    );

    Ok(LsattResult {
        levels: summaries,
        test,
    })
}
