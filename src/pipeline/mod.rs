//! Pipeline module - coarsening, matching, imbalance and estimation steps

pub mod coarsen;
pub mod formula;
pub mod glm;
pub mod imbalance;
pub mod loader;
pub mod lsatt;
pub mod matching;
pub mod regress;
pub mod relax;
pub mod schema;
pub mod table;
pub mod weights;

pub use coarsen::{coarsen, coarsen_column, cut_values};
pub use formula::{infer_formula, Formula};
pub use glm::{BinomialGlm, CoefficientRow, RegressionError, RegressionResult, WeightedRegression};
pub use imbalance::{
    imbalance, imbalance_params, univariate_imbalance, HistogramError, ImbalanceMeasure, ImbalanceParams,
    ImbalanceReport, ImbalanceScore, MarginalImbalance, PairImbalance, DEFAULT_MAX_BINS,
};
pub use loader::{dataset_stats, drop_columns, load_dataset, save_dataset};
pub use lsatt::{lsatt, LevelSummary, LsattResult, WelchTest};
pub use matching::{
    match_strata, match_weights, stratum_weights, summarize_match, MatchMode, MatchOptions, MatchOutcome,
    MatchSummary, ReferenceLevel,
};
pub use regress::{
    regress, CovariateEstimate, RegressOptions, RegressionOutcome, RegressionRow, SweepRow, SweepSample, SweepTable,
};
pub use relax::{rebin_treatment, relax, CoarseningGrid, RelaxOptions, RelaxationRow, RelaxationTable};
pub use schema::{BinSpec, Coarsening, CovariateCoarsening, CutMethod, Granularity};
pub use table::{numeric_values, retained_rows, LevelCount, TreatmentLevels};
pub use weights::{combine_weights, retained_count, total_weight, weights_from_column, with_weight_column};
