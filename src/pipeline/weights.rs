//! Weight vector extraction, validation and combination

use polars::prelude::*;

use super::table::require_column;
use crate::error::{CemError, Result};

/// Read a weight vector back from a DataFrame column (e.g. one written by `cem match`).
///
/// # Returns
/// * `Ok(Vec<f64>)` - One weight per row; nulls become 0 (row excluded)
/// * `Err` - If the column doesn't exist, is non-numeric, or holds negative, NaN or infinite values
pub fn weights_from_column(df: &DataFrame, weight_column: &str) -> Result<Vec<f64>> {
    let column = require_column(df, weight_column)?;

    let float_col = column.cast(&DataType::Float64).map_err(|_| CemError::NonNumericColumn {
        column: weight_column.to_string(),
        dtype: column.dtype().to_string(),
    })?;
    let ca = float_col.f64()?;

    let mut weights = Vec::with_capacity(df.height());
    let mut null_count = 0usize;

    for opt_val in ca.iter() {
        match opt_val {
            Some(w) => {
                validate_weight(weight_column, w)?;
                weights.push(w);
            }
            None => {
                null_count += 1;
                weights.push(0.0);
            }
        }
    }

    if null_count > 0 {
        tracing::warn!(
            column = weight_column,
            nulls = null_count,
            "weight column contains null values, treating them as unmatched (weight 0)"
        );
    }

    Ok(weights)
}

fn validate_weight(column: &str, w: f64) -> Result<()> {
    if w.is_nan() {
        return Err(CemError::Precondition(format!(
            "weight column '{}' contains NaN value. All weights must be valid numbers.",
            column
        )));
    }
    if w.is_infinite() {
        return Err(CemError::Precondition(format!(
            "weight column '{}' contains infinite value. All weights must be finite.",
            column
        )));
    }
    if w < 0.0 {
        return Err(CemError::Precondition(format!(
            "weight column '{}' contains negative value: {}. All weights must be non-negative.",
            column, w
        )));
    }
    Ok(())
}

/// Calculate the total weight (sum of all weights).
#[inline]
pub fn total_weight(weights: &[f64]) -> f64 {
    weights.iter().sum()
}

/// Number of rows kept by a match (strictly positive weight).
#[inline]
pub fn retained_count(weights: &[f64]) -> usize {
    weights.iter().filter(|&&w| w > 0.0).count()
}

/// Index-aligned sum of two weight vectors; positions past the end of the shorter one count as 0.
pub fn combine_weights(a: &[f64], b: &[f64]) -> Vec<f64> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).copied().unwrap_or(0.0) + b.get(i).copied().unwrap_or(0.0))
        .collect()
}

/// Attach a weight vector to a copy of `df` as a new Float64 column.
pub fn with_weight_column(df: &DataFrame, weights: &[f64], name: &str) -> Result<DataFrame> {
    if weights.len() != df.height() {
        return Err(CemError::Precondition(format!(
            "weight vector has {} entries but the frame has {} rows",
            weights.len(),
            df.height()
        )));
    }
    let mut out = df.clone();
    out.with_column(Column::new(name.into(), weights.to_vec()))?;
    Ok(out)
}
