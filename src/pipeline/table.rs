//! Column access helpers shared by the pipeline steps

use std::collections::HashMap;

use polars::prelude::*;
use serde::Serialize;

use crate::error::{CemError, Result};

/// Look up a column, mapping a miss to [`CemError::ColumnNotFound`].
pub(crate) fn require_column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column> {
    df.column(name)
        .map_err(|_| CemError::ColumnNotFound(name.to_string()))
}

/// True for dtypes that can be read as `f64` without losing meaning.
pub(crate) fn is_numeric(dtype: &DataType) -> bool {
    dtype.is_primitive_numeric() || matches!(dtype, DataType::Boolean)
}

/// Read a numeric column as `f64`. NaN is treated as missing.
pub fn numeric_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = require_column(df, name)?;
    column_as_f64(column)
}

pub(crate) fn column_as_f64(column: &Column) -> Result<Vec<Option<f64>>> {
    if !is_numeric(column.dtype()) {
        return Err(CemError::NonNumericColumn {
            column: column.name().to_string(),
            dtype: column.dtype().to_string(),
        });
    }
    let float_col = column.cast(&DataType::Float64)?;
    Ok(float_col
        .f64()?
        .iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect())
}

/// Hashable per-row codes for a grouping column.
///
/// Numeric values are keyed by their bit pattern (with `-0.0` folded into
/// `0.0`), everything else by its string rendering. Missing values map to
/// `None` and exclude the row from any stratum.
pub(crate) fn key_codes(column: &Column) -> Result<Vec<Option<u64>>> {
    if is_numeric(column.dtype()) {
        return Ok(column_as_f64(column)?
            .into_iter()
            .map(|v| v.map(|x| if x == 0.0 { 0.0f64.to_bits() } else { x.to_bits() }))
            .collect());
    }

    let string_col = column.cast(&DataType::String)?;
    let mut dictionary: HashMap<String, u64> = HashMap::new();
    let codes = string_col
        .str()?
        .iter()
        .map(|v| {
            v.map(|s| {
                let next = dictionary.len() as u64;
                *dictionary.entry(s.to_string()).or_insert(next)
            })
        })
        .collect();
    Ok(codes)
}

/// Count of rows observed at one treatment level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelCount {
    pub level: f64,
    pub count: usize,
}

/// Distinct treatment levels of a column and the level index of every row.
#[derive(Debug, Clone)]
pub struct TreatmentLevels {
    /// Distinct labels, ascending.
    pub levels: Vec<f64>,
    /// Index into `levels` per row; `None` for a missing treatment value.
    pub codes: Vec<Option<usize>>,
}

impl TreatmentLevels {
    pub fn from_frame(df: &DataFrame, treatment: &str) -> Result<Self> {
        Ok(Self::from_values(&numeric_values(df, treatment)?))
    }

    pub fn from_values(values: &[Option<f64>]) -> Self {
        let mut levels: Vec<f64> = values.iter().flatten().copied().collect();
        levels.sort_by(f64::total_cmp);
        levels.dedup();

        let codes = values
            .iter()
            .map(|v| v.and_then(|x| levels.binary_search_by(|l| l.total_cmp(&x)).ok()))
            .collect();

        Self { levels, codes }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Index of `level`, if present.
    pub fn position(&self, level: f64) -> Option<usize> {
        self.levels.iter().position(|&l| l == level)
    }

    /// Rows per level, in ascending level order. Levels with no rows are skipped.
    pub fn value_counts(&self) -> Vec<LevelCount> {
        let mut counts = vec![0usize; self.levels.len()];
        for code in self.codes.iter().flatten() {
            counts[*code] += 1;
        }
        self.levels
            .iter()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .map(|(&level, count)| LevelCount { level, count })
            .collect()
    }
}

/// Keep the rows whose weight is strictly positive.
pub fn retained_rows(df: &DataFrame, weights: &[f64]) -> Result<DataFrame> {
    if weights.len() != df.height() {
        return Err(CemError::Precondition(format!(
            "weight vector has {} entries but the frame has {} rows",
            weights.len(),
            df.height()
        )));
    }
    let mask: Vec<bool> = weights.iter().map(|&w| w > 0.0).collect();
    let mask = BooleanChunked::from_slice("retained".into(), &mask);
    Ok(df.filter(&mask)?)
}

/// Names of every column except the ones listed in `exclude`, in frame order.
pub fn columns_except(df: &DataFrame, exclude: &[&str]) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|s| s.to_string())
        .filter(|name| !exclude.contains(&name.as_str()))
        .collect()
}
