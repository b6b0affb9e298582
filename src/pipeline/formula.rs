//! Regression formulas of the form `outcome ~ a + b + c`

use std::fmt;
use std::str::FromStr;

use polars::prelude::DataFrame;
use serde::Serialize;

use super::table::{columns_except, require_column};
use crate::error::{CemError, Result};

/// Response column, additive terms and whether an intercept is fitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Formula {
    pub response: String,
    pub terms: Vec<String>,
    pub intercept: bool,
}

impl Formula {
    pub fn new(response: &str, terms: Vec<String>) -> Self {
        Self {
            response: response.to_string(),
            terms,
            intercept: true,
        }
    }

    /// Every column the formula reads, response first.
    pub fn columns(&self) -> Vec<&str> {
        std::iter::once(self.response.as_str())
            .chain(self.terms.iter().map(String::as_str))
            .collect()
    }
}

impl FromStr for Formula {
    type Err = CemError;

    /// Accepts `y ~ a + b`, with `+ 0` or `- 1` removing the intercept and `1` alone meaning intercept only.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| CemError::InvalidFormula {
            formula: s.to_string(),
            reason: reason.to_string(),
        };

        let (response, rhs) = s.split_once('~').ok_or_else(|| invalid("missing '~'"))?;
        let response = response.trim();
        if response.is_empty() {
            return Err(invalid("missing response"));
        }
        if rhs.contains('~') {
            return Err(invalid("more than one '~'"));
        }

        let mut intercept = true;
        let rhs = match rhs.trim().strip_suffix("- 1").or_else(|| rhs.trim().strip_suffix("-1")) {
            Some(rest) => {
                intercept = false;
                rest.to_string()
            }
            None => rhs.trim().to_string(),
        };

        let mut terms = Vec::new();
        for term in rhs.split('+').map(str::trim) {
            match term {
                "" if rhs.trim().is_empty() => {}
                "" => return Err(invalid("empty term")),
                "1" => intercept = true,
                "0" => intercept = false,
                t if t.contains('-') || t.contains('*') || t.contains(':') => {
                    return Err(invalid(&format!("unsupported term '{}'", t)))
                }
                t if t == response => return Err(invalid("response also used as a term")),
                t if !terms.iter().any(|existing| existing == t) => terms.push(t.to_string()),
                _ => {}
            }
        }

        if terms.is_empty() && !intercept {
            return Err(invalid("no terms and no intercept"));
        }

        Ok(Formula {
            response: response.to_string(),
            terms,
            intercept,
        })
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "{} ~ 1", self.response);
        }
        write!(f, "{} ~ {}", self.response, self.terms.join(" + "))?;
        if !self.intercept {
            write!(f, " - 1")?;
        }
        Ok(())
    }
}

/// `outcome ~` every other column of `df` not listed in `drop`, in frame order.
pub fn infer_formula(df: &DataFrame, outcome: &str, drop: &[String]) -> Result<Formula> {
    require_column(df, outcome)?;
    let mut exclude: Vec<&str> = vec![outcome];
    exclude.extend(drop.iter().map(String::as_str));
    Ok(Formula::new(outcome, columns_except(df, &exclude)))
}
