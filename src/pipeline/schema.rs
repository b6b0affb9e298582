//! Coarsening schema: which covariates to coarsen, how, and into how many bins
//!
//! A [`Coarsening`] keeps its covariates in declaration order. That order
//! decides the enumeration order of the relaxation grid, so it is preserved
//! through JSON loading and CLI parsing.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{CemError, Result};

/// Discretisation method for one covariate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CutMethod {
    /// Equal-width bins over the observed range (`cut`)
    #[serde(rename = "cut")]
    Cut,
    /// Equal-frequency bins from sample quantiles (`qcut`)
    #[serde(rename = "qcut")]
    QCut,
}

impl fmt::Display for CutMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CutMethod::Cut => write!(f, "cut"),
            CutMethod::QCut => write!(f, "qcut"),
        }
    }
}

impl FromStr for CutMethod {
    type Err = CemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cut" | "equal-width" | "width" => Ok(CutMethod::Cut),
            "qcut" | "equal-frequency" | "quantile" => Ok(CutMethod::QCut),
            _ => Err(CemError::UnsupportedMethod(s.to_string())),
        }
    }
}

/// Bin count for a covariate: fixed, or a sequence of candidates to relax over
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Granularity {
    Bins(usize),
    Sweep(Vec<usize>),
}

impl Granularity {
    pub fn is_sweep(&self) -> bool {
        matches!(self, Granularity::Sweep(_))
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Bins(n) => write!(f, "{}", n),
            Granularity::Sweep(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

/// Coarsening rule for a single covariate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CovariateCoarsening {
    #[serde(rename = "cut")]
    pub method: CutMethod,
    #[serde(rename = "bins")]
    pub granularity: Granularity,
}

impl CovariateCoarsening {
    pub fn new(method: CutMethod, granularity: Granularity) -> Self {
        Self { method, granularity }
    }

    /// The fixed bin count, or an error naming `covariate` when this rule is a sweep.
    pub fn bins(&self, covariate: &str) -> Result<usize> {
        match &self.granularity {
            Granularity::Bins(n) => Ok(*n),
            Granularity::Sweep(_) => Err(CemError::InvalidCoarsening(format!(
                "'{}' specifies a sequence of bin counts where a single count is required",
                covariate
            ))),
        }
    }
}

/// Ordered mapping from covariate name to its coarsening rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coarsening {
    entries: Vec<(String, CovariateCoarsening)>,
}

impl Coarsening {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; replaces an existing rule for the same covariate in place.
    pub fn with(mut self, covariate: &str, method: CutMethod, granularity: Granularity) -> Self {
        self.insert(covariate, CovariateCoarsening::new(method, granularity));
        self
    }

    pub fn insert(&mut self, covariate: &str, rule: CovariateCoarsening) {
        match self.entries.iter_mut().find(|(name, _)| name == covariate) {
            Some((_, existing)) => *existing = rule,
            None => self.entries.push((covariate.to_string(), rule)),
        }
    }

    pub fn get(&self, covariate: &str) -> Option<&CovariateCoarsening> {
        self.entries
            .iter()
            .find(|(name, _)| name == covariate)
            .map(|(_, rule)| rule)
    }

    pub fn contains(&self, covariate: &str) -> bool {
        self.get(covariate).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CovariateCoarsening)> {
        self.entries.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the covariates whose granularity is a sweep, in declaration order.
    pub fn swept(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, rule)| rule.granularity.is_sweep())
            .map(|(name, _)| name)
            .collect()
    }

    /// Product of the fixed bin counts. Fails if any entry is a sweep.
    pub fn total_bins(&self) -> Result<usize> {
        self.iter().try_fold(1usize, |acc, (name, rule)| -> Result<usize> {
            Ok(acc.saturating_mul(rule.bins(name)?))
        })
    }

    /// Parse a JSON schema such as
    /// `{"age": {"cut": "qcut", "bins": [2, 3, 4]}, "x": {"cut": "cut", "bins": 3}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| CemError::InvalidSchema(e.to_string()))?;

        let mut coarsening = Coarsening::new();
        for (name, value) in raw {
            let entry: RawEntry = serde_json::from_value(value)
                .map_err(|e| CemError::InvalidSchema(format!("'{}': {}", name, e)))?;
            let method: CutMethod = entry.cut.parse()?;
            coarsening.insert(&name, CovariateCoarsening::new(method, entry.bins.into_granularity(&name)?));
        }
        Ok(coarsening)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CemError::InvalidSchema(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Build a coarsening from CLI bin specs (see [`BinSpec`]).
    pub fn from_specs(specs: &[BinSpec]) -> Self {
        let mut coarsening = Coarsening::new();
        for spec in specs {
            coarsening.insert(&spec.covariate, spec.rule.clone());
        }
        coarsening
    }
}

impl fmt::Display for Coarsening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(name, rule)| format!("{}={}:{}", name, rule.method, rule.granularity))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

impl Serialize for Coarsening {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, rule) in &self.entries {
            map.serialize_entry(name, rule)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(alias = "method")]
    cut: String,
    bins: RawBins,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBins {
    Single(usize),
    List(Vec<usize>),
    Range { start: usize, end: usize },
}

impl RawBins {
    fn into_granularity(self, name: &str) -> Result<Granularity> {
        match self {
            RawBins::Single(n) => Ok(Granularity::Bins(n)),
            RawBins::List(values) => Ok(Granularity::Sweep(values)),
            RawBins::Range { start, end } => {
                if end <= start {
                    return Err(CemError::InvalidSchema(format!(
                        "'{}': empty bin range {}..{}",
                        name, start, end
                    )));
                }
                Ok(Granularity::Sweep((start..end).collect()))
            }
        }
    }
}

/// One `--bin` argument: `name=method:N`, `name=method:A..B` or `name=method:N1,N2,...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinSpec {
    pub covariate: String,
    pub rule: CovariateCoarsening,
}

impl FromStr for BinSpec {
    type Err = CemError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            CemError::InvalidSchema(format!(
                "bin spec '{}' {}; expected name=method:N, name=method:A..B or name=method:N1,N2",
                s, reason
            ))
        };

        let (covariate, rest) = s.split_once('=').ok_or_else(|| invalid("has no '='"))?;
        let (method, bins) = rest.split_once(':').ok_or_else(|| invalid("has no ':'"))?;
        let covariate = covariate.trim();
        if covariate.is_empty() {
            return Err(invalid("has an empty covariate name"));
        }
        let method: CutMethod = method.trim().parse()?;

        let parse_count = |v: &str| v.trim().parse::<usize>().map_err(|_| invalid("has a bad bin count"));
        let bins = bins.trim();
        let granularity = if let Some((start, end)) = bins.split_once("..") {
            let (start, end) = (parse_count(start)?, parse_count(end)?);
            if end <= start {
                return Err(invalid("has an empty range"));
            }
            Granularity::Sweep((start..end).collect())
        } else if bins.contains(',') {
            Granularity::Sweep(bins.split(',').map(&parse_count).collect::<Result<_>>()?)
        } else {
            Granularity::Bins(parse_count(bins)?)
        };

        Ok(BinSpec {
            covariate: covariate.to_string(),
            rule: CovariateCoarsening::new(method, granularity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_method_from_str() {
        assert_eq!("cut".parse::<CutMethod>().unwrap(), CutMethod::Cut);
        assert_eq!("QCUT".parse::<CutMethod>().unwrap(), CutMethod::QCut);
        assert_eq!("equal-frequency".parse::<CutMethod>().unwrap(), CutMethod::QCut);
        let err = "kmeans".parse::<CutMethod>().unwrap_err();
        assert!(matches!(err, CemError::UnsupportedMethod(ref m) if m == "kmeans"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_json_preserves_declaration_order() {
        let json = r#"{
            "zeta": {"cut": "qcut", "bins": [2, 3]},
            "alpha": {"cut": "cut", "bins": 4},
            "mid": {"method": "cut", "bins": {"start": 2, "end": 5}}
        }"#;
        let coarsening = Coarsening::from_json(json).unwrap();
        let names: Vec<&str> = coarsening.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            coarsening.get("mid").unwrap().granularity,
            Granularity::Sweep(vec![2, 3, 4])
        );
        assert_eq!(coarsening.get("alpha").unwrap().granularity, Granularity::Bins(4));
        assert_eq!(coarsening.swept(), vec!["zeta", "mid"]);
    }

    #[test]
    fn test_json_unknown_method_is_configuration_error() {
        let err = Coarsening::from_json(r#"{"x": {"cut": "kmeans", "bins": 3}}"#).unwrap_err();
        assert!(matches!(err, CemError::UnsupportedMethod(_)));
    }

    #[test]
    fn test_bin_spec_forms() {
        let single: BinSpec = "age=qcut:4".parse().unwrap();
        assert_eq!(single.covariate, "age");
        assert_eq!(single.rule.granularity, Granularity::Bins(4));

        let range: BinSpec = "income=cut:2..5".parse().unwrap();
        assert_eq!(range.rule.granularity, Granularity::Sweep(vec![2, 3, 4]));

        let list: BinSpec = "x=cut:3,5,8".parse().unwrap();
        assert_eq!(list.rule.granularity, Granularity::Sweep(vec![3, 5, 8]));

        assert!("age".parse::<BinSpec>().is_err());
        assert!("age=cut:5..2".parse::<BinSpec>().is_err());
        assert!(matches!(
            "age=kmeans:3".parse::<BinSpec>().unwrap_err(),
            CemError::UnsupportedMethod(_)
        ));
    }

    #[test]
    fn test_total_bins_and_display() {
        let coarsening = Coarsening::new()
            .with("a", CutMethod::Cut, Granularity::Bins(3))
            .with("b", CutMethod::QCut, Granularity::Bins(4));
        assert_eq!(coarsening.total_bins().unwrap(), 12);
        assert_eq!(coarsening.to_string(), "a=cut:3 b=qcut:4");

        let swept = coarsening.with("c", CutMethod::Cut, Granularity::Sweep(vec![2, 3]));
        assert!(swept.total_bins().is_err());
    }

    #[test]
    fn test_serialize_as_ordered_map() {
        let coarsening = Coarsening::new()
            .with("b", CutMethod::Cut, Granularity::Bins(2))
            .with("a", CutMethod::QCut, Granularity::Sweep(vec![2, 3]));
        let json = serde_json::to_string(&coarsening).unwrap();
        assert_eq!(
            json,
            r#"{"b":{"cut":"cut","bins":2},"a":{"cut":"qcut","bins":[2,3]}}"#
        );
    }
}
