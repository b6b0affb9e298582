//! Relaxation search over a Cartesian grid of coarsening granularities
//!
//! Every covariate of the rule supplies a sequence of candidate bin counts.
//! Each combination is matched and scored independently; the result table
//! trades retained sample size against imbalance.

use std::collections::BTreeSet;

use polars::prelude::*;
use rayon::prelude::*;
use serde::Serialize;

use super::coarsen::coarsen_column;
use super::imbalance::{imbalance_params, ImbalanceMeasure, ImbalanceParams, ImbalanceScore, DEFAULT_MAX_BINS};
use super::matching::{match_weights, MatchMode, MatchOptions, ReferenceLevel};
use super::schema::{Coarsening, CovariateCoarsening, CutMethod, Granularity};
use super::table::{require_column, retained_rows, LevelCount, TreatmentLevels};
use super::weights::retained_count;
use crate::error::{CemError, Result};
use crate::utils::progress::{create_progress_bar, finish_with_success, finish_with_warning};

/// Lazily enumerated Cartesian product of per-covariate bin sequences.
///
/// Combinations are numbered in nested-loop order with the last declared
/// covariate varying fastest.
#[derive(Debug, Clone)]
pub struct CoarseningGrid {
    axes: Vec<(String, CutMethod, Vec<usize>)>,
    len: usize,
}

impl CoarseningGrid {
    pub fn new(coarsening: &Coarsening) -> Result<Self> {
        let mut axes = Vec::with_capacity(coarsening.len());
        for (name, rule) in coarsening.iter() {
            let candidates = match &rule.granularity {
                Granularity::Sweep(values) if !values.is_empty() => values.clone(),
                Granularity::Sweep(_) => {
                    return Err(CemError::InvalidCoarsening(format!(
                        "'{}' has an empty sequence of bin counts",
                        name
                    )))
                }
                Granularity::Bins(_) => {
                    return Err(CemError::InvalidCoarsening(format!(
                        "ambiguous relaxation: '{}' has a single bin count, every covariate needs a sequence",
                        name
                    )))
                }
            };
            axes.push((name.to_string(), rule.method, candidates));
        }

        let len = axes
            .iter()
            .try_fold(1usize, |acc, (_, _, candidates)| acc.checked_mul(candidates.len()))
            .ok_or_else(|| CemError::InvalidCoarsening("relaxation grid is too large to enumerate".to_string()))?;

        Ok(Self { axes, len })
    }

    /// Number of combinations, known without walking the grid.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `index`-th combination as a scalar coarsening.
    pub fn combination(&self, index: usize) -> Option<Coarsening> {
        (index < self.len).then(|| self.decode(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = Coarsening> + '_ {
        (0..self.len).map(|index| self.decode(index))
    }

    fn decode(&self, index: usize) -> Coarsening {
        let mut picks = vec![0usize; self.axes.len()];
        let mut rest = index;
        for (pick, (_, _, candidates)) in picks.iter_mut().zip(&self.axes).rev() {
            *pick = candidates[rest % candidates.len()];
            rest /= candidates.len();
        }

        let mut coarsening = Coarsening::new();
        for ((name, method, _), bins) in self.axes.iter().zip(picks) {
            coarsening.insert(name, CovariateCoarsening::new(*method, Granularity::Bins(bins)));
        }
        coarsening
    }
}

/// Options for [`relax`]
#[derive(Debug, Clone)]
pub struct RelaxOptions {
    pub measure: ImbalanceMeasure,
    /// Covariates whose histogram bins are capped at `max_bins`
    pub continuous: Vec<String>,
    pub max_bins: usize,
    pub reference: ReferenceLevel,
    /// Evaluate grid points on the rayon pool
    pub parallel: bool,
    pub show_progress: bool,
}

impl Default for RelaxOptions {
    fn default() -> Self {
        Self {
            measure: ImbalanceMeasure::L1,
            continuous: Vec::new(),
            max_bins: DEFAULT_MAX_BINS,
            reference: ReferenceLevel::Largest,
            parallel: false,
            show_progress: false,
        }
    }
}

/// Outcome of one grid point
#[derive(Debug, Clone, Serialize)]
pub struct RelaxationRow {
    /// Position in enumeration order
    pub index: usize,
    pub imbalance: ImbalanceScore,
    pub coarsening: Coarsening,
    /// Product of every bin count in the combination
    pub bins: usize,
    /// Retained rows per treatment level; empty when nothing matched
    pub treatment_counts: Vec<LevelCount>,
}

impl RelaxationRow {
    pub fn retained(&self) -> usize {
        self.treatment_counts.iter().map(|c| c.count).sum()
    }
}

/// All grid points in enumeration order
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RelaxationTable {
    rows: Vec<RelaxationRow>,
}

impl RelaxationTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[RelaxationRow] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RelaxationRow> {
        self.rows.iter()
    }

    /// Lowest imbalance; the earliest row wins ties.
    pub fn best(&self) -> Option<&RelaxationRow> {
        self.rows.iter().fold(None, |best: Option<&RelaxationRow>, row| match best {
            Some(current) if current.imbalance.value() <= row.imbalance.value() => Some(current),
            _ => Some(row),
        })
    }

    /// Rows ranked by imbalance, enumeration order breaking ties.
    pub fn ranked(&self) -> Vec<&RelaxationRow> {
        let mut ranked: Vec<&RelaxationRow> = self.rows.iter().collect();
        ranked.sort_by(|a, b| a.imbalance.value().total_cmp(&b.imbalance.value()));
        ranked
    }

    /// Columns `imbalance`, `coarsening`, `bins` and one `treatment_<level>` per level seen.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let levels: BTreeSet<u64> = self
            .rows
            .iter()
            .flat_map(|row| row.treatment_counts.iter().map(|c| c.level.to_bits()))
            .collect();
        let mut levels: Vec<f64> = levels.into_iter().map(f64::from_bits).collect();
        levels.sort_by(f64::total_cmp);

        let mut columns = vec![
            Column::new(
                "imbalance".into(),
                self.rows.iter().map(|r| r.imbalance.value()).collect::<Vec<f64>>(),
            ),
            Column::new(
                "coarsening".into(),
                self.rows.iter().map(|r| r.coarsening.to_string()).collect::<Vec<String>>(),
            ),
            Column::new(
                "bins".into(),
                self.rows.iter().map(|r| r.bins as u64).collect::<Vec<u64>>(),
            ),
        ];
        for level in levels {
            let counts: Vec<Option<u64>> = self
                .rows
                .iter()
                .map(|row| {
                    row.treatment_counts
                        .iter()
                        .find(|c| c.level == level)
                        .map(|c| c.count as u64)
                })
                .collect();
            columns.push(Column::new(format!("treatment_{}", level).into(), counts));
        }

        Ok(DataFrame::new(columns)?)
    }
}

/// Match and score every combination of the relaxation grid.
///
/// Imbalance histogram parameters are computed once from the full frame, so
/// every grid point is scored on the same layout. Degenerate points (nothing
/// retained) score [`ImbalanceScore::WORST`] without aborting the sweep.
pub fn relax(df: &DataFrame, treatment: &str, coarsening: &Coarsening, options: &RelaxOptions) -> Result<RelaxationTable> {
    require_column(df, treatment)?;
    let grid = CoarseningGrid::new(coarsening)?;
    let params = imbalance_params(df, treatment, options.measure, &options.continuous, options.max_bins)?;

    tracing::debug!(grid = grid.len(), covariates = params.covariates.len(), "starting relaxation");

    let pb = create_progress_bar(grid.len() as u64, "   Relaxing", options.show_progress);
    let evaluate = |index: usize| -> Result<RelaxationRow> {
        let row = evaluate_point(df, treatment, index, grid.decode(index), &params, options);
        pb.inc(1);
        row
    };

    let rows = if options.parallel {
        (0..grid.len()).into_par_iter().map(evaluate).collect::<Result<Vec<_>>>()?
    } else {
        (0..grid.len()).map(evaluate).collect::<Result<Vec<_>>>()?
    };

    if rows.iter().any(|row| row.retained() > 0) {
        finish_with_success(&pb, &format!("Evaluated {} coarsenings", rows.len()));
    } else {
        finish_with_warning(&pb, &format!("None of {} coarsenings matched any stratum", rows.len()));
    }
    Ok(RelaxationTable { rows })
}

fn evaluate_point(
    df: &DataFrame,
    treatment: &str,
    index: usize,
    coarsening: Coarsening,
    params: &ImbalanceParams,
    options: &RelaxOptions,
) -> Result<RelaxationRow> {
    let match_options = MatchOptions {
        mode: MatchMode::OneToMany,
        reference: options.reference,
    };
    let weights = match_weights(df, treatment, &coarsening, &match_options)?;
    let bins = coarsening.total_bins()?;

    if retained_count(&weights) == 0 {
        tracing::debug!(index, coarsening = %coarsening, "no stratum matched");
        return Ok(RelaxationRow {
            index,
            imbalance: ImbalanceScore::WORST,
            coarsening,
            bins,
            treatment_counts: Vec::new(),
        });
    }

    let matched = rebin_treatment(retained_rows(df, &weights)?, treatment, &coarsening)?;
    let imbalance = options.measure.evaluate(&matched, treatment, params)?;
    let treatment_counts = TreatmentLevels::from_frame(&matched, treatment)?.value_counts();

    tracing::debug!(index, coarsening = %coarsening, imbalance = imbalance.value(), "scored");
    Ok(RelaxationRow {
        index,
        imbalance,
        coarsening,
        bins,
        treatment_counts,
    })
}

/// Re-bin a continuous treatment with its own rule when the coarsening names it.
pub fn rebin_treatment(matched: DataFrame, treatment: &str, coarsening: &Coarsening) -> Result<DataFrame> {
    match coarsening.get(treatment) {
        Some(rule) => coarsen_column(&matched, treatment, rule.method, rule.bins(treatment)?),
        None => Ok(matched),
    }
}
