//! Dataset loading and saving for CSV and Parquet files

use anyhow::{Context, Result};
use polars::prelude::*;
use std::path::Path;

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Load a dataset from a file (CSV or Parquet based on extension).
///
/// `infer_schema_length` applies to CSV only; 0 scans the whole file.
pub fn load_dataset(path: &Path, infer_schema_length: usize) -> Result<DataFrame> {
    let extension = extension_of(path);

    let lf = match extension.as_str() {
        "csv" => {
            let infer = (infer_schema_length > 0).then_some(infer_schema_length);
            LazyCsvReader::new(path)
                .with_infer_schema_length(infer)
                .finish()
                .with_context(|| format!("Failed to load CSV file: {}", path.display()))?
        }
        "parquet" => LazyFrame::scan_parquet(path, Default::default())
            .with_context(|| format!("Failed to load Parquet file: {}", path.display()))?,
        _ => anyhow::bail!(
            "Unsupported file format: {}. Supported formats: csv, parquet",
            extension
        ),
    };

    lf.collect()
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Save dataset to file (CSV or Parquet based on extension)
pub fn save_dataset(df: &mut DataFrame, path: &Path) -> Result<()> {
    let extension = extension_of(path);

    match extension.as_str() {
        "csv" => {
            let mut file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            CsvWriter::new(&mut file)
                .finish(df)
                .with_context(|| format!("Failed to write CSV file: {}", path.display()))?;
        }
        "parquet" => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            ParquetWriter::new(file)
                .finish(df)
                .with_context(|| format!("Failed to write Parquet file: {}", path.display()))?;
        }
        _ => anyhow::bail!(
            "Unsupported output format: {}. Supported formats: csv, parquet",
            extension
        ),
    }

    Ok(())
}

/// Rows, columns and estimated memory in MB
pub fn dataset_stats(df: &DataFrame) -> (usize, usize, f64) {
    let (rows, cols) = df.shape();
    let memory_mb = df.estimated_size() as f64 / (1024.0 * 1024.0);
    (rows, cols, memory_mb)
}

/// Drop the listed columns before analysis, failing on names the frame lacks.
pub fn drop_columns(df: DataFrame, columns: &[String]) -> Result<DataFrame> {
    if columns.is_empty() {
        return Ok(df);
    }
    let present: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    if let Some(missing) = columns.iter().find(|c| !present.contains(*c)) {
        anyhow::bail!("Column '{}' listed in --drop-columns not found in dataset", missing);
    }
    Ok(df.drop_many(columns.iter().map(String::as_str)))
}
