//! Error types for the CEM pipeline.
//!
//! Configuration mistakes (unsupported cut methods, one-to-one matching,
//! multi-axis regression sweeps) are kept apart from data problems so that
//! callers can tell a usage error from a dataset that simply does not match.
//! Degenerate matches and failed histograms are not errors at all: they are
//! reported as the worst-case imbalance score.

use polars::prelude::PolarsError;
use thiserror::Error;

use crate::pipeline::glm::RegressionError;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, CemError>;

/// Errors raised by coarsening, matching, imbalance and estimation.
#[derive(Debug, Error)]
pub enum CemError {
    /// Cut method other than equal-width or equal-frequency.
    #[error("\"{0}\" not supported. Coarsening only possible with \"cut\" and \"qcut\".")]
    UnsupportedMethod(String),

    /// A coarsening rule that cannot be applied as written.
    #[error("invalid coarsening: {0}")]
    InvalidCoarsening(String),

    /// A coarsening schema (JSON file or CLI bin spec) that failed to parse.
    #[error("invalid coarsening schema: {0}")]
    InvalidSchema(String),

    /// A regression formula that failed to parse.
    #[error("invalid formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },

    /// Requested behaviour that this version does not provide.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Explicit reference treatment level absent from the data.
    #[error("reference treatment level {0} is not present in the data")]
    UnknownReferenceLevel(f64),

    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("column '{column}' must be numeric ({dtype})")]
    NonNumericColumn { column: String, dtype: String },

    /// Fewer treatment levels than the operation needs.
    #[error("treatment column '{column}' has {found} level(s); at least {required} required")]
    InsufficientLevels {
        column: String,
        found: usize,
        required: usize,
    },

    /// Violated precondition on caller-supplied arguments.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error(transparent)]
    Regression(#[from] RegressionError),

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

impl CemError {
    /// True for errors caused by how the library was called rather than by the data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CemError::UnsupportedMethod(_)
                | CemError::InvalidCoarsening(_)
                | CemError::InvalidSchema(_)
                | CemError::InvalidFormula { .. }
                | CemError::NotImplemented(_)
                | CemError::UnknownReferenceLevel(_)
        )
    }
}
