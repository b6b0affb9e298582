//! Benchmark the relaxation search, sequential against rayon-parallel, and single matches
//!
//! Run with: cargo bench --bench relax_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use polars::prelude::*;
use rand::prelude::*;
use rand::SeedableRng;

use cem::pipeline::{match_weights, relax, Coarsening, CutMethod, Granularity, MatchOptions, RelaxOptions};

/// Generate covariates with treatment assignment depending on the first one
fn generate_test_dataframe(n_rows: usize, n_covariates: usize, seed: u64) -> DataFrame {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut columns: Vec<Column> = Vec::with_capacity(n_covariates + 1);
    let mut first: Vec<f64> = Vec::new();

    for i in 0..n_covariates {
        let values: Vec<f64> = (0..n_rows).map(|_| rng.gen::<f64>() * 100.0).collect();
        if i == 0 {
            first = values.clone();
        }
        columns.push(Column::new(format!("x{}", i).into(), values));
    }

    let treated: Vec<i32> = first
        .iter()
        .map(|&x| i32::from(rng.gen::<f64>() < 0.2 + 0.6 * x / 100.0))
        .collect();
    columns.push(Column::new("treated".into(), treated));

    DataFrame::new(columns).expect("Failed to create DataFrame")
}

fn sweep_all(n_covariates: usize, candidates: &[usize]) -> Coarsening {
    (0..n_covariates).fold(Coarsening::new(), |c, i| {
        c.with(&format!("x{}", i), CutMethod::Cut, Granularity::Sweep(candidates.to_vec()))
    })
}

fn continuous(n_covariates: usize) -> Vec<String> {
    (0..n_covariates).map(|i| format!("x{}", i)).collect()
}

/// Sequential vs parallel evaluation of the same grid
fn benchmark_relaxation(c: &mut Criterion) {
    let mut group = c.benchmark_group("relaxation");
    group.sample_size(10);

    let sizes = [(1_000, 2), (10_000, 3)];

    for (n_rows, n_covariates) in sizes {
        let df = generate_test_dataframe(n_rows, n_covariates, 42);
        let coarsening = sweep_all(n_covariates, &[2, 3, 4, 5]);
        let grid = 4usize.pow(n_covariates as u32);
        group.throughput(Throughput::Elements(grid as u64));

        for parallel in [false, true] {
            let options = RelaxOptions {
                continuous: continuous(n_covariates),
                parallel,
                ..Default::default()
            };
            let name = if parallel { "parallel" } else { "sequential" };
            group.bench_with_input(
                BenchmarkId::new(name, format!("{}x{}", n_rows, n_covariates)),
                &df,
                |b, df| {
                    b.iter(|| {
                        let _ = relax(black_box(df), black_box("treated"), black_box(&coarsening), &options);
                    });
                },
            );
        }
    }

    group.finish();
}

/// One coarsen-and-weight pass as the row count grows
fn benchmark_match_weights(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_weights");

    for n_rows in [10_000, 50_000, 100_000] {
        let df = generate_test_dataframe(n_rows, 3, 7);
        let coarsening = (0..3).fold(Coarsening::new(), |c, i| {
            c.with(&format!("x{}", i), CutMethod::QCut, Granularity::Bins(4))
        });
        group.throughput(Throughput::Elements(n_rows as u64));

        group.bench_with_input(BenchmarkId::new("qcut_4", n_rows), &df, |b, df| {
            b.iter(|| {
                let _ = match_weights(
                    black_box(df),
                    black_box("treated"),
                    black_box(&coarsening),
                    &MatchOptions::default(),
                );
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_relaxation, benchmark_match_weights);
criterion_main!(benches);
