//! Exact matching on coarsened strata and CEM multiplicity weights
//!
//! Rows are grouped on every non-treatment column of the coarsened frame.
//! A stratum survives only if it holds every treatment level present in the
//! frame; surviving rows at level `t` get
//!
//! ```text
//! w = 1                              if t is the reference level T
//! w = (M(t) / M(T)) * (m(T) / m(t))  otherwise
//! ```
//!
//! where `M` counts rows over all surviving strata and `m` within the stratum.
//! Rows in dropped strata, and rows with a missing key or treatment, weigh 0.

use std::collections::HashMap;

use polars::prelude::*;
use serde::Serialize;

use super::coarsen::coarsen;
use super::schema::Coarsening;
use super::table::{columns_except, key_codes, require_column, LevelCount, TreatmentLevels};
use crate::error::{CemError, Result};

/// How matched rows are weighted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum MatchMode {
    /// Every row of a valid stratum is kept with a multiplicity weight
    #[default]
    OneToMany,
    /// Pair matching within strata (not available)
    OneToOne,
}

/// Treatment level whose rows keep weight 1 in every stratum
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub enum ReferenceLevel {
    /// The numerically largest treatment label
    #[default]
    Largest,
    /// An explicit treatment label
    Level(f64),
}

/// Options for [`match_weights`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    pub mode: MatchMode,
    pub reference: ReferenceLevel,
}

/// Stratum bookkeeping collected while weighting
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchSummary {
    /// Distinct strata among rows with complete keys
    pub strata: usize,
    /// Strata holding every treatment level
    pub matched_strata: usize,
    /// Reference treatment label, if any stratum matched
    pub reference: Option<f64>,
    /// Row counts per treatment level before matching
    pub all: Vec<LevelCount>,
    /// Row counts per treatment level in matched strata
    pub matched: Vec<LevelCount>,
}

impl MatchSummary {
    pub fn retained(&self) -> usize {
        self.matched.iter().map(|c| c.count).sum()
    }
}

/// Weights plus the stratum summary they came from
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub weights: Vec<f64>,
    pub summary: MatchSummary,
}

/// Coarsen `df` and compute CEM weights for every row.
///
/// The returned vector is aligned with the rows of `df`. A coarsening under
/// which no stratum matches is not an error: every weight is 0.
pub fn match_weights(
    df: &DataFrame,
    treatment: &str,
    coarsening: &Coarsening,
    options: &MatchOptions,
) -> Result<Vec<f64>> {
    Ok(match_strata(df, treatment, coarsening, options)?.weights)
}

/// Like [`match_weights`], also returning the stratum summary.
pub fn match_strata(
    df: &DataFrame,
    treatment: &str,
    coarsening: &Coarsening,
    options: &MatchOptions,
) -> Result<MatchOutcome> {
    if options.mode == MatchMode::OneToOne {
        return Err(CemError::NotImplemented(
            "one-to-one matching; only one-to-many weighting is available".to_string(),
        ));
    }
    require_column(df, treatment)?;

    let coarse = coarsen(df, coarsening)?;
    let outcome = weigh_strata(&coarse, treatment, options.reference)?;

    tracing::debug!(
        coarsening = %coarsening,
        strata = outcome.summary.strata,
        matched_strata = outcome.summary.matched_strata,
        retained = outcome.summary.retained(),
        "matched"
    );
    Ok(outcome)
}

/// Stratum counts for a coarsening, without the weights.
pub fn summarize_match(
    df: &DataFrame,
    treatment: &str,
    coarsening: &Coarsening,
    options: &MatchOptions,
) -> Result<MatchSummary> {
    Ok(match_strata(df, treatment, coarsening, options)?.summary)
}

/// Weights for an already coarsened frame.
pub fn stratum_weights(coarsened: &DataFrame, treatment: &str, reference: ReferenceLevel) -> Result<Vec<f64>> {
    Ok(weigh_strata(coarsened, treatment, reference)?.weights)
}

/// Stratum index per row, `None` when any key column is missing.
fn assign_strata(df: &DataFrame, treatment: &str) -> Result<(Vec<Option<usize>>, usize)> {
    let key_columns = columns_except(df, &[treatment]);
    let codes: Vec<Vec<Option<u64>>> = key_columns
        .iter()
        .map(|name| key_codes(require_column(df, name)?))
        .collect::<Result<_>>()?;

    let mut index: HashMap<Vec<u64>, usize> = HashMap::new();
    let mut key = Vec::with_capacity(codes.len());
    let assignment: Vec<Option<usize>> = (0..df.height())
        .map(|row| {
            key.clear();
            for column in &codes {
                key.push(column[row]?);
            }
            let next = index.len();
            Some(*index.entry(key.clone()).or_insert(next))
        })
        .collect();

    Ok((assignment, index.len()))
}

fn weigh_strata(coarsened: &DataFrame, treatment: &str, reference: ReferenceLevel) -> Result<MatchOutcome> {
    let levels = TreatmentLevels::from_frame(coarsened, treatment)?;
    let (strata, n_strata) = assign_strata(coarsened, treatment)?;
    let n_levels = levels.len();

    let mut summary = MatchSummary {
        strata: n_strata,
        all: levels.value_counts(),
        ..Default::default()
    };
    let mut weights = vec![0.0; coarsened.height()];
    if n_levels == 0 {
        return Ok(MatchOutcome { weights, summary });
    }

    let reference = match reference {
        ReferenceLevel::Largest => n_levels - 1,
        ReferenceLevel::Level(label) => levels
            .position(label)
            .ok_or(CemError::UnknownReferenceLevel(label))?,
    };

    // m(t) per stratum
    let mut within = vec![vec![0usize; n_levels]; n_strata];
    for (stratum, level) in strata.iter().zip(&levels.codes) {
        if let (Some(s), Some(t)) = (stratum, level) {
            within[*s][*t] += 1;
        }
    }
    let valid: Vec<bool> = within.iter().map(|m| m.iter().all(|&c| c > 0)).collect();

    // M(t) over every valid stratum
    let mut global = vec![0usize; n_levels];
    for m in within.iter().zip(&valid).filter(|(_, v)| **v).map(|(m, _)| m) {
        for (total, count) in global.iter_mut().zip(m) {
            *total += count;
        }
    }
    summary.matched_strata = valid.iter().filter(|v| **v).count();
    if summary.matched_strata == 0 {
        return Ok(MatchOutcome { weights, summary });
    }

    for (row, (stratum, level)) in strata.iter().zip(&levels.codes).enumerate() {
        let (Some(s), Some(t)) = (stratum, level) else {
            continue;
        };
        if !valid[*s] {
            continue;
        }
        let m = &within[*s];
        weights[row] = if *t == reference {
            1.0
        } else {
            (global[*t] as f64 / global[reference] as f64) * (m[reference] as f64 / m[*t] as f64)
        };
    }

    summary.reference = Some(levels.levels[reference]);
    summary.matched = levels
        .levels
        .iter()
        .zip(&global)
        .map(|(&level, &count)| LevelCount { level, count })
        .collect();

    Ok(MatchOutcome { weights, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::{CutMethod, Granularity};

    fn toy_frame() -> DataFrame {
        df! {
            "x" => [0i32, 0, 0, 1, 1, 2],
            "treated" => [1i32, 0, 0, 1, 0, 0],
        }
        .unwrap()
    }

    #[test]
    fn test_multiplicity_weights() {
        let weights = match_weights(&toy_frame(), "treated", &Coarsening::new(), &MatchOptions::default()).unwrap();
        // M(1) = 2, M(0) = 3; stratum x=0 has m(1)=1, m(0)=2; x=1 has one of each
        let expected = [1.0, 0.75, 0.75, 1.0, 1.5, 0.0];
        for (w, e) in weights.iter().zip(expected) {
            assert!((w - e).abs() < 1e-12, "got {:?}", weights);
        }
    }

    #[test]
    fn test_control_weights_sum_to_matched_count() {
        let df = toy_frame();
        let outcome = match_strata(&df, "treated", &Coarsening::new(), &MatchOptions::default()).unwrap();
        let control_total: f64 = outcome
            .weights
            .iter()
            .zip(df.column("treated").unwrap().i32().unwrap().iter())
            .filter(|(_, t)| *t == Some(0))
            .map(|(w, _)| w)
            .sum();
        assert!((control_total - 3.0).abs() < 1e-12);
        assert_eq!(outcome.summary.strata, 3);
        assert_eq!(outcome.summary.matched_strata, 2);
        assert_eq!(outcome.summary.retained(), 5);
        assert_eq!(outcome.summary.reference, Some(1.0));
    }

    #[test]
    fn test_single_level_stratum_gets_zero_weight() {
        let df = df! {
            "x" => [0i32, 0, 1, 1],
            "treated" => [0i32, 0, 0, 1],
        }
        .unwrap();
        let weights = stratum_weights(&df, "treated", ReferenceLevel::Largest).unwrap();
        assert_eq!(&weights[..2], &[0.0, 0.0]);
        assert_eq!(&weights[2..], &[1.0, 1.0]);
    }

    #[test]
    fn test_one_to_one_not_implemented() {
        let options = MatchOptions {
            mode: MatchMode::OneToOne,
            ..Default::default()
        };
        let err = match_weights(&toy_frame(), "treated", &Coarsening::new(), &options).unwrap_err();
        assert!(matches!(err, CemError::NotImplemented(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_explicit_reference_level() {
        let weights = stratum_weights(&toy_frame(), "treated", ReferenceLevel::Level(0.0)).unwrap();
        // Controls are now the reference; treated rows are rescaled
        assert_eq!(weights[1], 1.0);
        // stratum x=0: (M(1)/M(0)) * (m(0)/m(1)) = (2/3) * 2
        assert!((weights[0] - 4.0 / 3.0).abs() < 1e-12);

        let err = stratum_weights(&toy_frame(), "treated", ReferenceLevel::Level(7.0)).unwrap_err();
        assert!(matches!(err, CemError::UnknownReferenceLevel(_)));
    }

    #[test]
    fn test_no_valid_strata_yields_zero_weights() {
        let df = df! {
            "x" => [0i32, 0, 1, 1],
            "treated" => [0i32, 0, 1, 1],
        }
        .unwrap();
        let weights = stratum_weights(&df, "treated", ReferenceLevel::Largest).unwrap();
        assert!(weights.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_missing_key_excludes_row() {
        let df = df! {
            "x" => [Some(0i32), Some(0), None, None],
            "treated" => [0i32, 1, 0, 1],
        }
        .unwrap();
        let weights = stratum_weights(&df, "treated", ReferenceLevel::Largest).unwrap();
        assert_eq!(weights, vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_coarsening_merges_strata() {
        let df = df! {
            "age" => [20.0f64, 21.0, 60.0, 61.0],
            "treated" => [0i32, 1, 0, 1],
        }
        .unwrap();
        // Exact values never match; two equal-width bins pair them up
        let fine = match_weights(&df, "treated", &Coarsening::new(), &MatchOptions::default()).unwrap();
        assert!(fine.iter().all(|&w| w == 0.0));

        let coarse = Coarsening::new().with("age", CutMethod::Cut, Granularity::Bins(2));
        let weights = match_weights(&df, "treated", &coarse, &MatchOptions::default()).unwrap();
        assert!(weights.iter().all(|&w| w == 1.0));
    }
}
