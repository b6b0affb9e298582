//! Command-line argument definitions using clap

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::pipeline::{BinSpec, Coarsening, Formula, ImbalanceMeasure, ReferenceLevel, DEFAULT_MAX_BINS};

/// CEM - Coarsened Exact Matching: coarsen covariates, match strata, weigh and score the result
#[derive(Parser, Debug)]
#[command(name = "cem")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Number of rows to use for schema inference (CSV only).
    /// Higher values improve type detection for ambiguous columns but may be slower.
    /// Use 0 for full table scan (very slow for large files).
    #[arg(long, default_value = "10000", global = true)]
    pub infer_schema_length: usize,

    /// Hide progress bars and spinners
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Columns to drop before processing (comma-separated).
    /// These columns will be removed from the dataset before any analysis.
    #[arg(long, value_delimiter = ',', global = true)]
    pub drop_columns: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score every coarsening in a grid of bin counts
    Relax(RelaxArgs),
    /// Fit a weighted logistic regression on the matched sample
    Regress(RegressArgs),
    /// Write the input with a CEM weight column
    Match(MatchArgs),
    /// Multivariate (and optionally marginal) L1 imbalance
    Imbalance(ImbalanceArgs),
    /// Local sample average treatment effect on the treated
    Lsatt(LsattArgs),
}

/// Dataset and treatment column
#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// Input file path (CSV or Parquet)
    #[arg(short, long)]
    pub input: PathBuf,

    /// Treatment column name
    #[arg(short, long)]
    pub treatment: String,
}

/// Coarsening from a JSON schema file or repeated `--bin` specs
#[derive(Args, Debug, Clone, Default)]
pub struct CoarseningArgs {
    /// JSON coarsening schema, e.g. {"age": {"cut": "qcut", "bins": [2, 3, 4]}}
    #[arg(short = 'c', long = "config", conflicts_with = "bins")]
    pub config: Option<PathBuf>,

    /// Coarsening rule: name=method:N, name=method:A..B or name=method:N1,N2,...
    /// Method is "cut" (equal width) or "qcut" (equal frequency). Repeatable.
    #[arg(long = "bin", value_parser = parse_bin_spec)]
    pub bins: Vec<BinSpec>,
}

impl CoarseningArgs {
    /// The coarsening these arguments describe; empty when neither is given.
    pub fn resolve(&self) -> Result<Coarsening> {
        match &self.config {
            Some(path) => Coarsening::from_json_file(path),
            None => Ok(Coarsening::from_specs(&self.bins)),
        }
    }
}

/// Histogram layout for the imbalance measure
#[derive(Args, Debug, Clone)]
pub struct MeasureArgs {
    /// Imbalance measure (only "l1" is available)
    #[arg(long, default_value = "l1", value_parser = parse_measure)]
    pub measure: ImbalanceMeasure,

    /// Covariates treated as continuous: their histogram bins are capped at --max-bins
    #[arg(long, value_delimiter = ',')]
    pub continuous: Vec<String>,

    /// Maximum histogram bins for continuous covariates
    #[arg(long, default_value_t = DEFAULT_MAX_BINS, value_parser = validate_max_bins)]
    pub max_bins: usize,
}

#[derive(Args, Debug)]
pub struct RelaxArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub coarsening: CoarseningArgs,

    #[command(flatten)]
    pub measure: MeasureArgs,

    /// Treatment level whose rows keep weight 1 (default: largest level)
    #[arg(long, allow_hyphen_values = true)]
    pub reference: Option<f64>,

    /// Evaluate grid points in parallel
    #[arg(long, default_value = "false")]
    pub parallel: bool,

    /// Write the full relaxation table to this JSON file
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Number of best coarsenings to display
    #[arg(long, default_value = "10")]
    pub top: usize,
}

#[derive(Args, Debug)]
pub struct RegressArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Binary outcome column
    #[arg(short = 'y', long)]
    pub outcome: String,

    #[command(flatten)]
    pub coarsening: CoarseningArgs,

    #[command(flatten)]
    pub measure: MeasureArgs,

    /// Regression formula, e.g. "y ~ treated + age". Inferred from the columns if omitted.
    #[arg(long, value_parser = parse_formula)]
    pub formula: Option<Formula>,

    /// Columns left out of the inferred formula (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub drop: Vec<String>,

    /// Treatment level whose rows keep weight 1 (default: largest level)
    #[arg(long, allow_hyphen_values = true)]
    pub reference: Option<f64>,

    /// Write the fitted coefficients to this JSON file
    #[arg(long)]
    pub export: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MatchArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub coarsening: CoarseningArgs,

    /// Output file path (CSV or Parquet, determined by extension).
    /// Defaults to input directory with '_matched' suffix (e.g., data.csv -> data_matched.csv).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Name of the weight column added to the output
    #[arg(long, default_value = "weight")]
    pub weight_column: String,

    /// Treatment level whose rows keep weight 1 (default: largest level)
    #[arg(long, allow_hyphen_values = true)]
    pub reference: Option<f64>,
}

impl MatchArgs {
    /// Get the output path, deriving from input if not explicitly provided.
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| derived_path(&self.data.input, "matched"))
    }
}

#[derive(Args, Debug)]
pub struct ImbalanceArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[command(flatten)]
    pub measure: MeasureArgs,

    // Also scores the sample matched under this coarsening
    #[command(flatten)]
    pub coarsening: CoarseningArgs,

    /// Report the imbalance of each covariate on its own
    #[arg(long, default_value = "false")]
    pub marginal: bool,
}

#[derive(Args, Debug)]
pub struct LsattArgs {
    #[command(flatten)]
    pub data: DataArgs,

    /// Outcome column
    #[arg(short = 'y', long)]
    pub outcome: String,

    #[command(flatten)]
    pub coarsening: CoarseningArgs,

    /// Take weights from this column instead of matching
    #[arg(long, conflicts_with_all = ["config", "bins"])]
    pub weight_column: Option<String>,

    /// Treatment level whose rows keep weight 1 (default: largest level)
    #[arg(long, allow_hyphen_values = true)]
    pub reference: Option<f64>,
}

/// Map an optional `--reference` to the matcher's reference level.
pub fn reference_level(reference: Option<f64>) -> ReferenceLevel {
    reference.map_or(ReferenceLevel::Largest, ReferenceLevel::Level)
}

/// `<dir>/<stem>_<suffix>.<ext>` next to `input`
fn derived_path(input: &Path, suffix: &str) -> PathBuf {
    let parent = input.parent().unwrap_or_else(|| Path::new("."));
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let extension = input.extension().and_then(|e| e.to_str()).unwrap_or("parquet");
    parent.join(format!("{}_{}.{}", stem, suffix, extension))
}

fn parse_bin_spec(s: &str) -> std::result::Result<BinSpec, String> {
    s.parse().map_err(|e: crate::error::CemError| e.to_string())
}

fn parse_measure(s: &str) -> std::result::Result<ImbalanceMeasure, String> {
    s.parse().map_err(|e: crate::error::CemError| e.to_string())
}

fn parse_formula(s: &str) -> std::result::Result<Formula, String> {
    s.parse().map_err(|e: crate::error::CemError| e.to_string())
}

/// Validator for max_bins parameter
fn validate_max_bins(s: &str) -> std::result::Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid bin count", s))?;

    if value == 0 {
        Err("max_bins must be at least 1".to_string())
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_max_bins() {
        assert_eq!(validate_max_bins("5"), Ok(5));
        assert!(validate_max_bins("0").is_err());
        assert!(validate_max_bins("-1").is_err());
    }

    #[test]
    fn test_derived_path() {
        let path = derived_path(Path::new("/data/study.csv"), "matched");
        assert_eq!(path, PathBuf::from("/data/study_matched.csv"));
    }

    #[test]
    fn test_reference_level() {
        assert_eq!(reference_level(None), ReferenceLevel::Largest);
        assert_eq!(reference_level(Some(0.0)), ReferenceLevel::Level(0.0));
    }
}
