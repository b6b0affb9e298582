//! Multivariate imbalance between treatment levels
//!
//! The L1 measure bins every non-treatment covariate independently of the
//! coarsening used for matching, builds one joint histogram per treatment
//! level, normalises each by that level's row count, and reports half the
//! summed absolute cell differences per pair of levels. 0 means identical
//! distributions; 1 means disjoint support.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use polars::prelude::*;
use serde::Serialize;
use thiserror::Error;

use super::table::{column_as_f64, columns_except, require_column, TreatmentLevels};
use crate::error::{CemError, Result};

/// Default cap on histogram bins for covariates declared continuous
pub const DEFAULT_MAX_BINS: usize = 5;

/// Supported imbalance measures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ImbalanceMeasure {
    /// Half the L1 distance between normalised joint histograms
    #[default]
    #[serde(rename = "l1")]
    L1,
}

impl fmt::Display for ImbalanceMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImbalanceMeasure::L1 => write!(f, "l1"),
        }
    }
}

impl FromStr for ImbalanceMeasure {
    type Err = CemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "l1" => Ok(ImbalanceMeasure::L1),
            _ => Err(CemError::NotImplemented(format!(
                "\"{}\" is not a valid imbalance measure (available: l1)",
                s
            ))),
        }
    }
}

impl ImbalanceMeasure {
    /// Score `matched` (covariates plus treatment) under this measure.
    ///
    /// Degenerate histograms are not errors: they are logged and reported as
    /// [`ImbalanceScore::WORST`]. Missing or non-numeric columns still fail.
    pub fn evaluate(&self, matched: &DataFrame, treatment: &str, params: &ImbalanceParams) -> Result<ImbalanceScore> {
        match self {
            ImbalanceMeasure::L1 => {
                let sample = Sample::from_frame(matched, treatment)?;
                match l1_distance(&sample, params) {
                    Ok(score) => Ok(score),
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            measure = %self,
                            covariates = sample.columns.len(),
                            bins = params.bins.len(),
                            "histogram construction failed, reporting worst-case imbalance"
                        );
                        Ok(ImbalanceScore::WORST)
                    }
                }
            }
        }
    }
}

/// Degenerate inputs that make a histogram meaningless
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistogramError {
    #[error("no rows to histogram")]
    Empty,

    #[error("only {0} treatment level(s) present, at least 2 are needed")]
    SingleLevel(usize),

    #[error("{covariates} covariates but {bins} bin counts and {ranges} ranges")]
    DimensionMismatch {
        covariates: usize,
        bins: usize,
        ranges: usize,
    },

    #[error("covariate '{0}' has zero histogram bins")]
    ZeroBins(String),
}

/// Per-covariate histogram layout, fixed before any matching
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImbalanceParams {
    pub covariates: Vec<String>,
    pub bins: Vec<usize>,
    pub ranges: Vec<(f64, f64)>,
}

/// L1 distance between one pair of treatment levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairImbalance {
    pub levels: (f64, f64),
    pub imbalance: f64,
}

/// A scalar for two treatment levels, one entry per level pair otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ImbalanceScore {
    Scalar(f64),
    Pairwise(Vec<PairImbalance>),
}

impl ImbalanceScore {
    /// Maximal imbalance, used for degenerate matches and failed histograms
    pub const WORST: ImbalanceScore = ImbalanceScore::Scalar(1.0);

    /// Scalar summary: the score itself, or the worst pair.
    pub fn value(&self) -> f64 {
        match self {
            ImbalanceScore::Scalar(v) => *v,
            ImbalanceScore::Pairwise(pairs) => pairs.iter().map(|p| p.imbalance).fold(0.0, f64::max),
        }
    }
}

impl fmt::Display for ImbalanceScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImbalanceScore::Scalar(v) => write!(f, "{:.4}", v),
            ImbalanceScore::Pairwise(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|p| format!("{}-{}: {:.4}", p.levels.0, p.levels.1, p.imbalance))
                    .collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

/// Score together with the layout it was computed under
#[derive(Debug, Clone, Serialize)]
pub struct ImbalanceReport {
    pub score: ImbalanceScore,
    pub params: ImbalanceParams,
}

/// Marginal imbalance of a single covariate
#[derive(Debug, Clone, Serialize)]
pub struct MarginalImbalance {
    pub covariate: String,
    pub imbalance: ImbalanceScore,
    pub measure: ImbalanceMeasure,
}

/// Histogram layout for every non-treatment column of `df`, in frame order.
///
/// Bins are the number of distinct values, capped at `max_bins` for columns
/// listed in `continuous`; ranges are the observed `(min, max)`.
pub fn imbalance_params(
    df: &DataFrame,
    treatment: &str,
    measure: ImbalanceMeasure,
    continuous: &[String],
    max_bins: usize,
) -> Result<ImbalanceParams> {
    require_column(df, treatment)?;
    match measure {
        ImbalanceMeasure::L1 => {
            let covariates = columns_except(df, &[treatment]);
            let mut bins = Vec::with_capacity(covariates.len());
            let mut ranges = Vec::with_capacity(covariates.len());

            for name in &covariates {
                let mut observed: Vec<f64> = column_as_f64(require_column(df, name)?)?
                    .into_iter()
                    .flatten()
                    .collect();
                observed.sort_by(f64::total_cmp);

                let range = match (observed.first(), observed.last()) {
                    (Some(&lo), Some(&hi)) => (lo, hi),
                    _ => (f64::NAN, f64::NAN),
                };
                observed.dedup();

                let distinct = observed.len();
                bins.push(if continuous.contains(name) {
                    distinct.min(max_bins)
                } else {
                    distinct
                });
                ranges.push(range);
            }

            Ok(ImbalanceParams {
                covariates,
                bins,
                ranges,
            })
        }
    }
}

/// Score `df` under `measure`, returning the params alongside the score.
pub fn imbalance(
    df: &DataFrame,
    treatment: &str,
    measure: ImbalanceMeasure,
    params: &ImbalanceParams,
) -> Result<ImbalanceReport> {
    let score = measure.evaluate(df, treatment, params)?;
    Ok(ImbalanceReport {
        score,
        params: params.clone(),
    })
}

/// Imbalance of each non-treatment column on its own, under caller-fixed bins and ranges.
pub fn univariate_imbalance(
    df: &DataFrame,
    treatment: &str,
    measure: ImbalanceMeasure,
    bins: &[usize],
    ranges: &[(f64, f64)],
) -> Result<Vec<MarginalImbalance>> {
    require_column(df, treatment)?;
    let covariates = columns_except(df, &[treatment]);
    if covariates.len() != bins.len() || bins.len() != ranges.len() {
        return Err(CemError::Precondition(format!(
            "lengths not equal: {} covariates, {} bin counts, {} ranges",
            covariates.len(),
            bins.len(),
            ranges.len()
        )));
    }

    covariates
        .into_iter()
        .zip(bins.iter().zip(ranges))
        .map(|(covariate, (&bin, &range))| -> Result<MarginalImbalance> {
            let marginal = df.select([covariate.as_str(), treatment])?;
            let params = ImbalanceParams {
                covariates: vec![covariate.clone()],
                bins: vec![bin],
                ranges: vec![range],
            };
            let imbalance = measure.evaluate(&marginal, treatment, &params)?;
            Ok(MarginalImbalance {
                covariate,
                imbalance,
                measure,
            })
        })
        .collect()
}

/// Numeric covariates and treatment codes pulled out of a frame
struct Sample {
    names: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
    levels: TreatmentLevels,
}

impl Sample {
    fn from_frame(df: &DataFrame, treatment: &str) -> Result<Self> {
        let levels = TreatmentLevels::from_frame(df, treatment)?;
        let names = columns_except(df, &[treatment]);
        let columns = names
            .iter()
            .map(|name| column_as_f64(require_column(df, name)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { names, columns, levels })
    }

    fn rows(&self) -> usize {
        self.levels.codes.len()
    }
}

/// `n + 1` evenly spaced edges from `lo` to `hi`, degenerate ranges widened by 0.5 each side.
fn histogram_edges(lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    let (lo, hi) = if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) };
    let step = (hi - lo) / bins as f64;
    let mut edges: Vec<f64> = (0..=bins).map(|i| lo + step * i as f64).collect();
    edges[bins] = hi;
    edges
}

/// Half-open bin `[e_i, e_{i+1})` holding `x`, with the last bin closed; `None` outside the range.
#[inline]
fn histogram_bin(edges: &[f64], x: f64) -> Option<u32> {
    let bins = edges.len() - 1;
    if x == edges[bins] {
        return Some(bins as u32 - 1);
    }
    let pos = edges.partition_point(|&e| e <= x);
    (1..=bins).contains(&pos).then(|| (pos - 1) as u32)
}

type Histogram = HashMap<Vec<u32>, usize>;

fn l1_distance(sample: &Sample, params: &ImbalanceParams) -> std::result::Result<ImbalanceScore, HistogramError> {
    let dims = sample.columns.len();
    if params.bins.len() != dims || params.ranges.len() != dims {
        return Err(HistogramError::DimensionMismatch {
            covariates: dims,
            bins: params.bins.len(),
            ranges: params.ranges.len(),
        });
    }
    if let Some(i) = params.bins.iter().position(|&b| b == 0) {
        return Err(HistogramError::ZeroBins(sample.names[i].clone()));
    }
    if sample.rows() == 0 || sample.levels.is_empty() {
        return Err(HistogramError::Empty);
    }
    if sample.levels.len() < 2 {
        return Err(HistogramError::SingleLevel(sample.levels.len()));
    }

    let edges: Vec<Vec<f64>> = params
        .bins
        .iter()
        .zip(&params.ranges)
        .map(|(&bins, &(lo, hi))| histogram_edges(lo, hi, bins))
        .collect();

    let n_levels = sample.levels.len();
    let mut histograms: Vec<Histogram> = vec![HashMap::new(); n_levels];
    let mut totals = vec![0usize; n_levels];

    'rows: for (row, level) in sample.levels.codes.iter().enumerate() {
        let Some(level) = *level else {
            continue;
        };
        totals[level] += 1;

        let mut cell = Vec::with_capacity(dims);
        for (column, edges) in sample.columns.iter().zip(&edges) {
            match column[row].and_then(|x| histogram_bin(edges, x)) {
                Some(bin) => cell.push(bin),
                None => continue 'rows,
            }
        }
        *histograms[level].entry(cell).or_insert(0) += 1;
    }

    let mut pairs = Vec::with_capacity(n_levels * (n_levels - 1) / 2);
    for a in 0..n_levels {
        for b in (a + 1)..n_levels {
            pairs.push(PairImbalance {
                levels: (sample.levels.levels[a], sample.levels.levels[b]),
                imbalance: pair_distance(&histograms[a], totals[a], &histograms[b], totals[b]),
            });
        }
    }

    if pairs.len() == 1 {
        Ok(ImbalanceScore::Scalar(pairs[0].imbalance))
    } else {
        Ok(ImbalanceScore::Pairwise(pairs))
    }
}

fn pair_distance(left: &Histogram, n_left: usize, right: &Histogram, n_right: usize) -> f64 {
    let (n_left, n_right) = (n_left as f64, n_right as f64);
    let mut total = 0.0;
    for (cell, &count) in left {
        let other = right.get(cell).copied().unwrap_or(0) as f64;
        total += (count as f64 / n_left - other / n_right).abs();
    }
    for (cell, &count) in right {
        if !left.contains_key(cell) {
            total += count as f64 / n_right;
        }
    }
    total / 2.0
}
