//! JSON export of relaxation and regression results

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::pipeline::{ImbalanceMeasure, RegressionOutcome, RelaxationTable};

/// Run metadata written ahead of the result rows
#[derive(Debug, Clone, Serialize)]
pub struct ExportMetadata {
    pub timestamp: String,
    pub cem_version: String,
    pub input_file: String,
    pub treatment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub measure: ImbalanceMeasure,
    pub grid_size: usize,
}

impl ExportMetadata {
    pub fn new(input_file: &Path, treatment: &str, measure: ImbalanceMeasure, grid_size: usize) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            cem_version: env!("CARGO_PKG_VERSION").to_string(),
            input_file: input_file.display().to_string(),
            treatment: treatment.to_string(),
            outcome: None,
            measure,
            grid_size,
        }
    }

    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }
}

#[derive(Serialize)]
struct ResultExport<'a, T: Serialize> {
    metadata: &'a ExportMetadata,
    rows: &'a T,
}

fn write_json<T: Serialize>(rows: &T, metadata: &ExportMetadata, output_path: &Path) -> Result<()> {
    let export = ResultExport { metadata, rows };
    let json = serde_json::to_string_pretty(&export).context("Failed to serialize results to JSON")?;
    std::fs::write(output_path, json)
        .with_context(|| format!("Failed to write results to {}", output_path.display()))?;
    Ok(())
}

/// Export a relaxation table, one row per grid point in enumeration order.
pub fn export_relaxation(table: &RelaxationTable, metadata: &ExportMetadata, output_path: &Path) -> Result<()> {
    write_json(table, metadata, output_path)
}

/// Export a single fit as a one-element row list, or every sweep step.
pub fn export_regression(outcome: &RegressionOutcome, metadata: &ExportMetadata, output_path: &Path) -> Result<()> {
    match outcome {
        RegressionOutcome::Single(row) => write_json(&[row], metadata, output_path),
        RegressionOutcome::Sweep(table) => write_json(table, metadata, output_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ImbalanceScore, RegressionRow};
    use tempfile::TempDir;

    #[test]
    fn test_export_single_regression() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fit.json");
        let row = RegressionRow {
            result: None,
            error: None,
            imbalance: ImbalanceScore::WORST,
            treatment_counts: Vec::new(),
        };
        let metadata = ExportMetadata::new(Path::new("data.csv"), "treated", ImbalanceMeasure::L1, 1).with_outcome("y");
        export_regression(&RegressionOutcome::Single(row), &metadata, &path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["metadata"]["treatment"], "treated");
        assert_eq!(value["metadata"]["outcome"], "y");
        assert_eq!(value["metadata"]["measure"], "l1");
        assert_eq!(value["metadata"]["cem_version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(value["rows"].as_array().unwrap().len(), 1);
        assert!(value["rows"][0]["result"].is_null());
    }

    #[test]
    fn test_metadata_omits_missing_outcome() {
        let metadata = ExportMetadata::new(Path::new("data.csv"), "t", ImbalanceMeasure::L1, 6);
        let json = serde_json::to_value(&metadata).unwrap();
        assert!(json.get("outcome").is_none());
        assert_eq!(json["grid_size"], 6);
    }
}
