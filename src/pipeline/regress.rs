//! Weighted regression on matched samples, optionally swept over one covariate's granularity

use polars::prelude::*;
use serde::Serialize;

use super::formula::{infer_formula, Formula};
use super::glm::{RegressionResult, WeightedRegression};
use super::imbalance::{imbalance_params, ImbalanceMeasure, ImbalanceParams, ImbalanceScore, DEFAULT_MAX_BINS};
use super::matching::{match_weights, MatchMode, MatchOptions, ReferenceLevel};
use super::relax::rebin_treatment;
use super::schema::{Coarsening, CovariateCoarsening, Granularity};
use super::table::{require_column, retained_rows, LevelCount, TreatmentLevels};
use super::weights::retained_count;
use crate::error::{CemError, Result};
use crate::utils::progress::{create_progress_bar, finish_with_success, finish_with_warning};

/// Options for [`regress`]
#[derive(Debug, Clone)]
pub struct RegressOptions {
    pub measure: ImbalanceMeasure,
    /// Explicit formula; inferred from the frame when `None`
    pub formula: Option<Formula>,
    /// Columns left out of an inferred formula
    pub drop: Vec<String>,
    pub continuous: Vec<String>,
    pub max_bins: usize,
    pub reference: ReferenceLevel,
    pub show_progress: bool,
}

impl Default for RegressOptions {
    fn default() -> Self {
        Self {
            measure: ImbalanceMeasure::L1,
            formula: None,
            drop: Vec::new(),
            continuous: Vec::new(),
            max_bins: DEFAULT_MAX_BINS,
            reference: ReferenceLevel::Largest,
            show_progress: false,
        }
    }
}

/// Fit, imbalance and retained counts for one scalar coarsening
#[derive(Debug, Clone, Serialize)]
pub struct RegressionRow {
    /// `None` when no stratum matched or the fit failed
    pub result: Option<RegressionResult>,
    pub imbalance: ImbalanceScore,
    pub treatment_counts: Vec<LevelCount>,
    /// Why a sweep step has no fit although strata matched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegressionRow {
    fn unmatched() -> Self {
        Self {
            result: None,
            imbalance: ImbalanceScore::WORST,
            treatment_counts: Vec::new(),
            error: None,
        }
    }
}

/// One step of a single-covariate sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepRow {
    pub n_bins: usize,
    pub covariate: String,
    #[serde(flatten)]
    pub row: RegressionRow,
}

/// Coefficient of one term at one sweep step
#[derive(Debug, Clone, Serialize)]
pub struct CovariateEstimate {
    pub n_bins: usize,
    pub covariate: String,
    pub term: String,
    pub coef: f64,
    pub std_err: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Sample information for one sweep step
#[derive(Debug, Clone, Serialize)]
pub struct SweepSample {
    pub n_bins: usize,
    pub imbalance: f64,
    pub observations: usize,
    pub treatment_counts: Vec<LevelCount>,
}

/// Sweep results in candidate order
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct SweepTable {
    rows: Vec<SweepRow>,
}

impl SweepTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[SweepRow] {
        &self.rows
    }

    /// Step for a given bin count.
    pub fn get(&self, n_bins: usize) -> Option<&SweepRow> {
        self.rows.iter().find(|r| r.n_bins == n_bins)
    }

    /// Long form: one entry per (bin count, term). Unmatched steps contribute nothing.
    pub fn covariates(&self) -> Vec<CovariateEstimate> {
        self.rows
            .iter()
            .filter_map(|step| step.row.result.as_ref().map(|result| (step, result)))
            .flat_map(|(step, result)| {
                result.coefficients.iter().map(move |c| CovariateEstimate {
                    n_bins: step.n_bins,
                    covariate: step.covariate.clone(),
                    term: c.term.clone(),
                    coef: c.coef,
                    std_err: c.std_err,
                    z: c.z,
                    p_value: c.p_value,
                })
            })
            .collect()
    }

    pub fn coarsenings(&self) -> Vec<SweepSample> {
        self.rows
            .iter()
            .map(|step| SweepSample {
                n_bins: step.n_bins,
                imbalance: step.row.imbalance.value(),
                observations: step.row.result.as_ref().map_or(0, |r| r.n_obs),
                treatment_counts: step.row.treatment_counts.clone(),
            })
            .collect()
    }
}

/// Result of [`regress`]: a single fit, or one row per swept bin count
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RegressionOutcome {
    Single(RegressionRow),
    Sweep(SweepTable),
}

/// Match, score and fit `model` on the matched rows.
///
/// With every granularity fixed this is one fit. If exactly one covariate
/// carries a sequence of bin counts, each candidate is fitted in turn; more
/// than one sequence is rejected.
pub fn regress(
    df: &DataFrame,
    treatment: &str,
    outcome: &str,
    coarsening: &Coarsening,
    options: &RegressOptions,
    model: &dyn WeightedRegression,
) -> Result<RegressionOutcome> {
    require_column(df, treatment)?;
    require_column(df, outcome)?;

    let formula = match &options.formula {
        Some(formula) => formula.clone(),
        None => infer_formula(df, outcome, &options.drop)?,
    };

    let features = df.drop(outcome)?;
    let params = imbalance_params(&features, treatment, options.measure, &options.continuous, options.max_bins)?;
    let context = FitContext {
        df,
        features: &features,
        treatment,
        formula: &formula,
        params: &params,
        options,
        model,
    };

    let swept = coarsening.swept();
    match swept.as_slice() {
        [] => Ok(RegressionOutcome::Single(context.fit(coarsening, false)?)),
        [covariate] => {
            let covariate = covariate.to_string();
            Ok(RegressionOutcome::Sweep(context.sweep(coarsening, &covariate)?))
        }
        many => Err(CemError::NotImplemented(format!(
            "regression sweep over {} covariates ({}); at most one covariate may carry a sequence of bin counts",
            many.len(),
            many.join(", ")
        ))),
    }
}

struct FitContext<'a> {
    df: &'a DataFrame,
    features: &'a DataFrame,
    treatment: &'a str,
    formula: &'a Formula,
    params: &'a ImbalanceParams,
    options: &'a RegressOptions,
    model: &'a dyn WeightedRegression,
}

impl FitContext<'_> {
    fn sweep(&self, coarsening: &Coarsening, covariate: &str) -> Result<SweepTable> {
        let Some(rule) = coarsening.get(covariate) else {
            return Err(CemError::ColumnNotFound(covariate.to_string()));
        };
        let Granularity::Sweep(candidates) = &rule.granularity else {
            return Err(CemError::InvalidCoarsening(format!("'{}' is not swept", covariate)));
        };

        tracing::info!(
            candidates = candidates.len(),
            method = %rule.method,
            covariate,
            "regressing over bin counts"
        );
        let pb = create_progress_bar(candidates.len() as u64, "   Regressing", self.options.show_progress);

        let mut rows = Vec::with_capacity(candidates.len());
        for &n_bins in candidates {
            let mut step = coarsening.clone();
            step.insert(covariate, CovariateCoarsening::new(rule.method, Granularity::Bins(n_bins)));
            let row = self.fit(&step, true)?;
            rows.push(SweepRow {
                n_bins,
                covariate: covariate.to_string(),
                row,
            });
            pb.inc(1);
        }

        let failed = rows.iter().filter(|r| r.row.error.is_some()).count();
        if failed == 0 {
            finish_with_success(&pb, &format!("Fitted {} coarsenings of '{}'", rows.len(), covariate));
        } else {
            finish_with_warning(
                &pb,
                &format!("{} of {} fits of '{}' failed", failed, rows.len(), covariate),
            );
        }
        Ok(SweepTable { rows })
    }

    /// Match on `coarsening` and fit the matched rows. With `keep_failures`
    /// a model error becomes a row carrying the message instead of an `Err`.
    fn fit(&self, coarsening: &Coarsening, keep_failures: bool) -> Result<RegressionRow> {
        let match_options = MatchOptions {
            mode: MatchMode::OneToMany,
            reference: self.options.reference,
        };
        let weights = match_weights(self.features, self.treatment, coarsening, &match_options)?;
        if retained_count(&weights) == 0 {
            tracing::debug!(coarsening = %coarsening, "no stratum matched, skipping fit");
            return Ok(RegressionRow::unmatched());
        }

        let matched = rebin_treatment(retained_rows(self.features, &weights)?, self.treatment, coarsening)?;
        let imbalance = self.options.measure.evaluate(&matched, self.treatment, self.params)?;
        let treatment_counts = TreatmentLevels::from_frame(&matched, self.treatment)?.value_counts();

        let data = retained_rows(self.df, &weights)?;
        let positive: Vec<f64> = weights.iter().copied().filter(|&w| w > 0.0).collect();
        let (result, error) = match self.model.fit(self.formula, &data, &positive) {
            Ok(result) => (Some(result), None),
            Err(err) if keep_failures => {
                tracing::warn!(coarsening = %coarsening, error = %err, "regression failed for this coarsening");
                (None, Some(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        Ok(RegressionRow {
            result,
            imbalance,
            treatment_counts,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::glm::BinomialGlm;
    use crate::pipeline::schema::CutMethod;

    fn frame() -> DataFrame {
        let n = 40;
        df! {
            "x" => (0..n).map(|i| i as f64).collect::<Vec<_>>(),
            "treated" => (0..n).map(|i| i % 2).collect::<Vec<i32>>(),
            "y" => (0..n).map(|i| i32::from(i % 5 == 0 || i % 5 == 3)).collect::<Vec<i32>>(),
        }
        .unwrap()
    }

    #[test]
    fn test_single_fit() {
        let coarsening = Coarsening::new().with("x", CutMethod::Cut, Granularity::Bins(4));
        let outcome = regress(
            &frame(),
            "treated",
            "y",
            &coarsening,
            &RegressOptions::default(),
            &BinomialGlm::default(),
        )
        .unwrap();

        let RegressionOutcome::Single(row) = outcome else {
            panic!("expected a single fit");
        };
        let result = row.result.unwrap();
        assert_eq!(result.formula, "y ~ x + treated");
        assert_eq!(result.n_obs, 40);
        assert!(result.coefficient("treated").is_some());
        assert_eq!(row.treatment_counts.len(), 2);
    }

    #[test]
    fn test_sweep_tags_rows_and_survives_degenerate_steps() {
        let coarsening = Coarsening::new().with("x", CutMethod::Cut, Granularity::Sweep(vec![2, 4, 40]));
        let outcome = regress(
            &frame(),
            "treated",
            "y",
            &coarsening,
            &RegressOptions::default(),
            &BinomialGlm::default(),
        )
        .unwrap();

        let RegressionOutcome::Sweep(table) = outcome else {
            panic!("expected a sweep");
        };
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows()[0].covariate, "x");
        assert!(table.get(2).unwrap().row.result.is_some());

        // 40 bins put every row in its own stratum
        let degenerate = table.get(40).unwrap();
        assert!(degenerate.row.result.is_none());
        assert_eq!(degenerate.row.imbalance, ImbalanceScore::WORST);

        let long = table.covariates();
        assert_eq!(long.len(), 2 * 3);
        assert!(long.iter().all(|c| c.n_bins != 40));

        let samples = table.coarsenings();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].observations, 40);
        assert_eq!(samples[2].observations, 0);
    }

    #[test]
    fn test_two_swept_covariates_not_implemented() {
        let df = df! {
            "a" => [1.0f64, 2.0, 3.0, 4.0],
            "b" => [1.0f64, 2.0, 3.0, 4.0],
            "treated" => [0i32, 1, 0, 1],
            "y" => [0i32, 1, 1, 0],
        }
        .unwrap();
        let coarsening = Coarsening::new()
            .with("a", CutMethod::Cut, Granularity::Sweep(vec![1, 2]))
            .with("b", CutMethod::QCut, Granularity::Sweep(vec![1, 2]));
        let err = regress(
            &df,
            "treated",
            "y",
            &coarsening,
            &RegressOptions::default(),
            &BinomialGlm::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CemError::NotImplemented(_)));
    }

    #[test]
    fn test_explicit_formula_and_drop() {
        let options = RegressOptions {
            drop: vec!["x".to_string()],
            ..Default::default()
        };
        let coarsening = Coarsening::new().with("x", CutMethod::Cut, Granularity::Bins(2));
        let outcome = regress(&frame(), "treated", "y", &coarsening, &options, &BinomialGlm::default()).unwrap();
        let RegressionOutcome::Single(row) = outcome else {
            panic!("expected a single fit");
        };
        assert_eq!(row.result.unwrap().formula, "y ~ treated");

        let options = RegressOptions {
            formula: Some("y ~ x".parse().unwrap()),
            ..Default::default()
        };
        let outcome = regress(&frame(), "treated", "y", &coarsening, &options, &BinomialGlm::default()).unwrap();
        let RegressionOutcome::Single(row) = outcome else {
            panic!("expected a single fit");
        };
        assert!(row.result.unwrap().coefficient("treated").is_none());
    }
}
