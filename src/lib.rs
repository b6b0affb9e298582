//! cem: Coarsened Exact Matching
//!
//! A library for matching treatment and control observations on coarsened
//! covariates, measuring the remaining multivariate imbalance, searching
//! over coarsening granularities, and estimating weighted treatment effects.

pub mod cli;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod utils;

pub use error::{CemError, Result};
