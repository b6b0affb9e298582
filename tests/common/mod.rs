//! Shared test utilities and fixture generators

#![allow(dead_code)]

use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tempfile::TempDir;

/// Full factorial over `x` in 0..=10, `y` in {0, 1} and `treated` in {0, 1}.
///
/// Both treatment levels see exactly the same covariate rows, so any
/// coarsening retains every row and the imbalance is 0.
pub fn create_balanced_dataframe() -> DataFrame {
    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut treated = Vec::new();
    for xv in 0..=10 {
        for yv in 0..2i32 {
            for t in 0..2i32 {
                x.push(xv as f64);
                y.push(yv);
                treated.push(t);
            }
        }
    }
    df! {
        "x" => x,
        "y" => y,
        "treated" => treated,
    }
    .unwrap()
}

/// Observational data where older subjects are more likely to be treated.
///
/// - `age`: uniform on [18, 80)
/// - `income`: uniform on [20, 120), loosely tied to age
/// - `educ`: integer level 0..=3
/// - `treated`: 0/1, probability rising with age
/// - `outcome`: 0/1, logistic in treatment and age
pub fn create_observational_dataframe(rows: usize, seed: u64) -> DataFrame {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut age = Vec::with_capacity(rows);
    let mut income = Vec::with_capacity(rows);
    let mut educ = Vec::with_capacity(rows);
    let mut treated = Vec::with_capacity(rows);
    let mut outcome = Vec::with_capacity(rows);

    for _ in 0..rows {
        let a: f64 = rng.gen_range(18.0..80.0);
        let inc: f64 = rng.gen_range(20.0..120.0) + 0.2 * (a - 18.0);
        let e: i32 = rng.gen_range(0..4);
        let p_treat = 0.2 + 0.6 * (a - 18.0) / 62.0;
        let t = i32::from(rng.gen::<f64>() < p_treat);
        let logit = -1.0 + 0.8 * t as f64 + 0.02 * (a - 50.0);
        let p_outcome = 1.0 / (1.0 + (-logit).exp());
        let o = i32::from(rng.gen::<f64>() < p_outcome);

        age.push(a);
        income.push(inc);
        educ.push(e);
        treated.push(t);
        outcome.push(o);
    }

    df! {
        "age" => age,
        "income" => income,
        "educ" => educ,
        "treated" => treated,
        "outcome" => outcome,
    }
    .unwrap()
}

/// Two covariates whose values never overlap between treatment levels
pub fn create_disjoint_dataframe() -> DataFrame {
    df! {
        "x" => [0.0f64, 0.0, 0.0, 1.0, 1.0, 1.0],
        "treated" => [0i32, 0, 0, 1, 1, 1],
    }
    .unwrap()
}

/// Create a temporary directory with a test CSV file
pub fn create_temp_csv(df: &mut DataFrame) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let csv_path = temp_dir.path().join("test_data.csv");

    let mut file = std::fs::File::create(&csv_path).unwrap();
    CsvWriter::new(&mut file).finish(df).unwrap();

    (temp_dir, csv_path)
}

/// Create a temporary directory with a test Parquet file
pub fn create_temp_parquet(df: &mut DataFrame) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let parquet_path = temp_dir.path().join("test_data.parquet");

    let file = std::fs::File::create(&parquet_path).unwrap();
    ParquetWriter::new(file).finish(df).unwrap();

    (temp_dir, parquet_path)
}

/// Treatment labels of `df` as f64, for comparing against weights
pub fn treatment_values(df: &DataFrame, treatment: &str) -> Vec<f64> {
    df.column(treatment)
        .unwrap()
        .cast(&DataType::Float64)
        .unwrap()
        .f64()
        .unwrap()
        .into_no_null_iter()
        .collect()
}
