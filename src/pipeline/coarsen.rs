//! Coarsening: replacing covariate values with 0-based bin indices
//!
//! Two methods are supported:
//! - `cut`: equal-width bins over the observed range, right-closed, with the
//!   lowest edge nudged down by 0.1% of the range so the minimum lands in bin 0
//! - `qcut`: equal-frequency bins from linearly interpolated sample quantiles,
//!   right-closed with the lowest edge included; duplicate edges are dropped so
//!   heavily tied data collapses into fewer bins instead of failing

use polars::prelude::*;

use super::schema::{Coarsening, CutMethod};
use super::table::{column_as_f64, require_column};
use crate::error::{CemError, Result};

/// Fraction of the range used to extend the first equal-width edge
const RANGE_EXTENSION: f64 = 0.001;

/// Bin every value of a column. Missing values stay missing.
pub fn cut_values(values: &[Option<f64>], method: CutMethod, bins: usize) -> Result<Vec<Option<u32>>> {
    if bins == 0 {
        return Err(CemError::InvalidCoarsening(
            "bin count must be at least 1".to_string(),
        ));
    }

    let mut observed: Vec<f64> = values.iter().flatten().copied().collect();
    if observed.is_empty() {
        return Ok(vec![None; values.len()]);
    }
    observed.sort_by(f64::total_cmp);

    let edges = match method {
        CutMethod::Cut => equal_width_edges(observed[0], observed[observed.len() - 1], bins),
        CutMethod::QCut => quantile_edges(&observed, bins),
    };

    // Constant data, or quantiles that all coincide: a single bin.
    if edges.len() < 2 {
        return Ok(values.iter().map(|v| v.map(|_| 0)).collect());
    }

    let last_bin = edges.len() - 2;
    Ok(values
        .iter()
        .map(|v| v.map(|x| right_closed_bin(&edges, x).min(last_bin) as u32))
        .collect())
}

/// Index of the right-closed interval `(e_i, e_{i+1}]` holding `x`; the lowest edge is inclusive.
#[inline]
fn right_closed_bin(edges: &[f64], x: f64) -> usize {
    edges.partition_point(|&e| e < x).max(1) - 1
}

fn equal_width_edges(min: f64, max: f64, bins: usize) -> Vec<f64> {
    if min == max {
        return vec![min];
    }
    let width = max - min;
    let mut edges: Vec<f64> = (0..=bins)
        .map(|i| min + width * i as f64 / bins as f64)
        .collect();
    edges[bins] = max;
    edges[0] -= width * RANGE_EXTENSION;
    edges
}

fn quantile_edges(sorted: &[f64], bins: usize) -> Vec<f64> {
    let mut edges: Vec<f64> = (0..=bins)
        .map(|k| quantile(sorted, k as f64 / bins as f64))
        .collect();
    edges.dedup();
    edges
}

/// Linear-interpolation quantile of already sorted data.
pub(crate) fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Replace one numeric column of `df` with its bin indices.
pub fn coarsen_column(df: &DataFrame, name: &str, method: CutMethod, bins: usize) -> Result<DataFrame> {
    let values = column_as_f64(require_column(df, name)?)?;
    let codes = cut_values(&values, method, bins)?;

    let mut out = df.clone();
    out.with_column(Column::new(name.into(), codes))?;
    Ok(out)
}

/// Apply a scalar coarsening to a copy of `df`.
///
/// Every covariate named in `coarsening` becomes a `UInt32` column of bin
/// indices; all other columns pass through unchanged. The input frame is
/// never modified.
pub fn coarsen(df: &DataFrame, coarsening: &Coarsening) -> Result<DataFrame> {
    let mut out = df.clone();
    for (name, rule) in coarsening.iter() {
        let bins = rule.bins(name)?;
        let values = column_as_f64(require_column(df, name)?)?;
        let codes = cut_values(&values, rule.method, bins)?;
        out.with_column(Column::new(name.into(), codes))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::Granularity;

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().map(|&v| Some(v)).collect()
    }

    #[test]
    fn test_equal_width_bins() {
        let values = some(&[0.0, 2.5, 5.0, 7.5, 10.0]);
        let codes = cut_values(&values, CutMethod::Cut, 2).unwrap();
        // Right-closed: 5.0 falls in the first bin (0, 5]
        assert_eq!(codes, vec![Some(0), Some(0), Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn test_equal_width_minimum_in_first_bin() {
        let values = some(&[1.0, 2.0, 3.0, 4.0]);
        let codes = cut_values(&values, CutMethod::Cut, 3).unwrap();
        assert_eq!(codes[0], Some(0));
        assert_eq!(codes[3], Some(2));
    }

    #[test]
    fn test_constant_column_is_one_bin() {
        let values = some(&[4.2; 6]);
        for bins in [1, 2, 5, 10] {
            let codes = cut_values(&values, CutMethod::Cut, bins).unwrap();
            assert!(codes.iter().all(|c| *c == Some(0)));
            let codes = cut_values(&values, CutMethod::QCut, bins).unwrap();
            assert!(codes.iter().all(|c| *c == Some(0)));
        }
    }

    #[test]
    fn test_quantile_bins_balanced() {
        let values: Vec<Option<f64>> = (1..=8).map(|v| Some(v as f64)).collect();
        let codes = cut_values(&values, CutMethod::QCut, 4).unwrap();
        assert_eq!(
            codes,
            vec![Some(0), Some(0), Some(1), Some(1), Some(2), Some(2), Some(3), Some(3)]
        );
    }

    #[test]
    fn test_quantile_ties_collapse() {
        // Fewer distinct values than requested bins must not fail
        let values = some(&[1.0, 1.0, 1.0, 1.0, 2.0, 3.0]);
        let codes = cut_values(&values, CutMethod::QCut, 5).unwrap();
        let distinct: std::collections::HashSet<_> = codes.iter().flatten().collect();
        assert!(distinct.len() <= 2);
        assert_eq!(codes[0], codes[3]);
        assert_ne!(codes[0], codes[5]);
    }

    #[test]
    fn test_missing_values_pass_through() {
        let values = vec![Some(1.0), None, Some(3.0)];
        let codes = cut_values(&values, CutMethod::Cut, 2).unwrap();
        assert_eq!(codes[1], None);
        assert!(cut_values(&[None, None], CutMethod::QCut, 3).unwrap().iter().all(Option::is_none));
    }

    #[test]
    fn test_zero_bins_is_configuration_error() {
        let err = cut_values(&some(&[1.0, 2.0]), CutMethod::Cut, 0).unwrap_err();
        assert!(matches!(err, CemError::InvalidCoarsening(_)));
    }

    #[test]
    fn test_quantile_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sorted, 0.0), 1.0);
        assert_eq!(quantile(&sorted, 1.0), 4.0);
        assert!((quantile(&sorted, 0.5) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_coarsen_leaves_input_untouched() {
        let df = df! {
            "age" => [20.0f64, 30.0, 40.0, 50.0],
            "group" => ["a", "b", "a", "b"],
            "treated" => [0i32, 1, 0, 1],
        }
        .unwrap();
        let coarsening = Coarsening::new().with("age", CutMethod::Cut, Granularity::Bins(2));

        let coarse = coarsen(&df, &coarsening).unwrap();
        assert_eq!(coarse.column("age").unwrap().dtype(), &DataType::UInt32);
        assert_eq!(coarse.column("group").unwrap().dtype(), &DataType::String);
        assert_eq!(df.column("age").unwrap().dtype(), &DataType::Float64);
    }

    #[test]
    fn test_coarsen_errors() {
        let df = df! { "age" => [1.0f64, 2.0], "name" => ["x", "y"] }.unwrap();

        let missing = Coarsening::new().with("height", CutMethod::Cut, Granularity::Bins(2));
        assert!(matches!(coarsen(&df, &missing), Err(CemError::ColumnNotFound(_))));

        let text = Coarsening::new().with("name", CutMethod::Cut, Granularity::Bins(2));
        assert!(matches!(coarsen(&df, &text), Err(CemError::NonNumericColumn { .. })));

        let sweep = Coarsening::new().with("age", CutMethod::Cut, Granularity::Sweep(vec![2, 3]));
        assert!(matches!(coarsen(&df, &sweep), Err(CemError::InvalidCoarsening(_))));
    }
}
