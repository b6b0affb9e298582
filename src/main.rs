//! CEM: Coarsened Exact Matching CLI
//!
//! Coarsens covariates, matches treatment levels within strata, scores the
//! resulting balance and estimates treatment effects on the matched sample.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use polars::prelude::DataFrame;
use tracing_subscriber::EnvFilter;

use cem::cli::{
    reference_level, Cli, Commands, DataArgs, ImbalanceArgs, LsattArgs, MatchArgs, RegressArgs, RelaxArgs,
};
use cem::pipeline::{
    dataset_stats, drop_columns, imbalance, imbalance_params, load_dataset, lsatt, match_strata, match_weights,
    rebin_treatment, regress, relax, retained_rows, save_dataset, univariate_imbalance, weights_from_column, with_weight_column,
    BinomialGlm, CoarseningGrid, MatchOptions, RegressOptions, RegressionOutcome, RelaxOptions,
};
use cem::report::{
    display_imbalance, display_lsatt, display_match, display_regression, display_relaxation, display_sweep,
    export_regression, export_relaxation, ExportMetadata,
};
use cem::utils::{
    create_spinner, finish_with_success, print_banner, print_completion, print_config, print_count, print_info,
    print_step_header, print_step_time, print_success, print_warning,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    print_banner(env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Relax(args) => run_relax(&cli, args),
        Commands::Regress(args) => run_regress(&cli, args),
        Commands::Match(args) => run_match(&cli, args),
        Commands::Imbalance(args) => run_imbalance(&cli, args),
        Commands::Lsatt(args) => run_lsatt(&cli, args),
    }
}

/// Library diagnostics go to stderr, filtered by `CEM_LOG` (default: warn)
fn init_tracing() {
    let filter = EnvFilter::try_from_env("CEM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Step 1 for every command: load, drop columns, check the treatment column.
fn load_input(cli: &Cli, data: &DataArgs) -> Result<DataFrame> {
    print_step_header(1, "Loading Dataset");
    let step_start = Instant::now();

    let spinner = create_spinner("Loading dataset...", !cli.quiet);
    let df = load_dataset(&data.input, cli.infer_schema_length)?;
    let df = drop_columns(df, &cli.drop_columns)?;
    finish_with_success(&spinner, "Dataset loaded");

    let (rows, cols, memory_mb) = dataset_stats(&df);
    println!("\n    {} Dataset Statistics:", style("✧").cyan());
    println!("      Rows: {}", rows);
    println!("      Columns: {}", cols);
    println!("      Estimated memory: {:.2} MB", memory_mb);
    if !cli.drop_columns.is_empty() {
        print_count("column(s) dropped before analysis", cli.drop_columns.len(), None);
    }
    print_step_time(step_start.elapsed());

    let column_names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    if !column_names.contains(&data.treatment) {
        anyhow::bail!(
            "Treatment column '{}' not found in dataset. Available columns: {:?}",
            data.treatment,
            column_names
        );
    }
    Ok(df)
}

fn run_relax(cli: &Cli, args: &RelaxArgs) -> Result<()> {
    let coarsening = args.coarsening.resolve()?;
    let grid = CoarseningGrid::new(&coarsening)?;

    print_config(
        &args.data.input,
        &args.data.treatment,
        &[
            ("Coarsening", coarsening.to_string()),
            ("Grid", format!("{} coarsenings", grid.len())),
            ("Measure", args.measure.measure.to_string()),
        ],
    );

    let df = load_input(cli, &args.data)?;

    print_step_header(2, "Relaxation Search");
    let step_start = Instant::now();
    let options = RelaxOptions {
        measure: args.measure.measure,
        continuous: args.measure.continuous.clone(),
        max_bins: args.measure.max_bins,
        reference: reference_level(args.reference),
        parallel: args.parallel,
        show_progress: !cli.quiet,
    };
    let table = relax(&df, &args.data.treatment, &coarsening, &options)?;
    print_step_time(step_start.elapsed());

    display_relaxation(&table, args.top);

    match table.best() {
        Some(best) if !best.treatment_counts.is_empty() => {
            println!();
            print_success(&format!(
                "Lowest imbalance {} at {}",
                best.imbalance, best.coarsening
            ));
        }
        _ => print_warning("No coarsening in the grid produced a matched stratum"),
    }

    if let Some(path) = &args.export {
        let metadata = ExportMetadata::new(&args.data.input, &args.data.treatment, options.measure, table.len());
        export_relaxation(&table, &metadata, path)?;
        print_success(&format!("Relaxation table saved to: {}", path.display()));
    }

    print_completion();
    Ok(())
}

fn run_regress(cli: &Cli, args: &RegressArgs) -> Result<()> {
    let coarsening = args.coarsening.resolve()?;

    let mut settings = vec![
        ("Outcome", args.outcome.clone()),
        ("Coarsening", coarsening.to_string()),
    ];
    if let Some(formula) = &args.formula {
        settings.push(("Formula", formula.to_string()));
    }
    print_config(&args.data.input, &args.data.treatment, &settings);

    let df = load_input(cli, &args.data)?;

    print_step_header(2, "Weighted Regression");
    let step_start = Instant::now();
    let options = RegressOptions {
        measure: args.measure.measure,
        formula: args.formula.clone(),
        drop: args.drop.clone(),
        continuous: args.measure.continuous.clone(),
        max_bins: args.measure.max_bins,
        reference: reference_level(args.reference),
        show_progress: !cli.quiet,
    };
    let outcome = regress(
        &df,
        &args.data.treatment,
        &args.outcome,
        &coarsening,
        &options,
        &BinomialGlm::default(),
    )
    .with_context(|| format!("Weighted regression of '{}' failed", args.outcome))?;
    print_step_time(step_start.elapsed());

    let fits = match &outcome {
        RegressionOutcome::Single(row) => {
            display_regression(row);
            1
        }
        RegressionOutcome::Sweep(table) => {
            display_sweep(table);
            table.len()
        }
    };

    if let Some(path) = &args.export {
        let metadata = ExportMetadata::new(&args.data.input, &args.data.treatment, options.measure, fits)
            .with_outcome(&args.outcome);
        export_regression(&outcome, &metadata, path)?;
        print_success(&format!("Regression results saved to: {}", path.display()));
    }

    print_completion();
    Ok(())
}

fn run_match(cli: &Cli, args: &MatchArgs) -> Result<()> {
    let coarsening = args.coarsening.resolve()?;
    let output_path = args.output_path();

    print_config(
        &args.data.input,
        &args.data.treatment,
        &[
            ("Coarsening", coarsening.to_string()),
            ("Output", output_path.display().to_string()),
        ],
    );

    let df = load_input(cli, &args.data)?;

    print_step_header(2, "Exact Matching");
    let step_start = Instant::now();
    let options = MatchOptions {
        reference: reference_level(args.reference),
        ..Default::default()
    };
    let outcome = match_strata(&df, &args.data.treatment, &coarsening, &options)?;
    print_count(
        "matched strata",
        outcome.summary.matched_strata,
        Some(&format!("(of {})", outcome.summary.strata)),
    );
    print_step_time(step_start.elapsed());

    display_match(&outcome.summary);
    if outcome.summary.matched_strata == 0 {
        print_warning("No stratum holds every treatment level; all weights are 0");
    }

    print_step_header(3, "Saving Results");
    let mut weighted = with_weight_column(&df, &outcome.weights, &args.weight_column)?;
    save_output(&mut weighted, &output_path, cli.quiet)?;

    print_completion();
    Ok(())
}

fn run_imbalance(cli: &Cli, args: &ImbalanceArgs) -> Result<()> {
    let coarsening = args.coarsening.resolve()?;

    let mut settings = vec![("Measure", args.measure.measure.to_string())];
    if !coarsening.is_empty() {
        settings.push(("Coarsening", coarsening.to_string()));
    }
    print_config(&args.data.input, &args.data.treatment, &settings);

    let df = load_input(cli, &args.data)?;
    let treatment = args.data.treatment.as_str();
    let measure = args.measure.measure;

    print_step_header(2, "Imbalance");
    let step_start = Instant::now();
    let params = imbalance_params(&df, treatment, measure, &args.measure.continuous, args.measure.max_bins)?;
    let report = imbalance(&df, treatment, measure, &params)?;
    let marginal = if args.marginal {
        Some(univariate_imbalance(&df, treatment, measure, &params.bins, &params.ranges)?)
    } else {
        None
    };
    print_step_time(step_start.elapsed());
    display_imbalance(&report, marginal.as_deref());

    if !coarsening.is_empty() {
        print_step_header(3, "Imbalance After Matching");
        let weights = match_weights(&df, treatment, &coarsening, &MatchOptions::default())?;
        let matched = rebin_treatment(retained_rows(&df, &weights)?, treatment, &coarsening)?;
        if matched.height() == 0 {
            print_warning("No stratum matched under this coarsening");
        } else {
            let report = imbalance(&matched, treatment, measure, &params)?;
            let marginal = if args.marginal {
                Some(univariate_imbalance(&matched, treatment, measure, &params.bins, &params.ranges)?)
            } else {
                None
            };
            print_info(&format!("{} of {} rows retained", matched.height(), df.height()));
            display_imbalance(&report, marginal.as_deref());
        }
    }

    print_completion();
    Ok(())
}

fn run_lsatt(cli: &Cli, args: &LsattArgs) -> Result<()> {
    let coarsening = args.coarsening.resolve()?;

    let weights_from = match &args.weight_column {
        Some(column) => format!("column '{}'", column),
        None => coarsening.to_string(),
    };
    print_config(
        &args.data.input,
        &args.data.treatment,
        &[("Outcome", args.outcome.clone()), ("Weights", weights_from)],
    );

    let df = load_input(cli, &args.data)?;

    print_step_header(2, "Weights");
    let weights = match &args.weight_column {
        Some(column) => weights_from_column(&df, column)?,
        None => {
            // The outcome never defines strata
            let covariates = df.drop(&args.outcome)?;
            let options = MatchOptions {
                reference: reference_level(args.reference),
                ..Default::default()
            };
            match_weights(&covariates, &args.data.treatment, &coarsening, &options)?
        }
    };
    print_count(
        "row(s) with positive weight",
        weights.iter().filter(|&&w| w > 0.0).count(),
        None,
    );

    print_step_header(3, "Effect Estimate");
    let result = lsatt(&df, &args.data.treatment, &args.outcome, &weights)
        .with_context(|| format!("LSATT of '{}' failed", args.outcome))?;
    display_lsatt(&result);

    print_completion();
    Ok(())
}

fn save_output(df: &mut DataFrame, path: &Path, quiet: bool) -> Result<()> {
    let step_start = Instant::now();
    let spinner = create_spinner("Saving dataset...", !quiet);
    save_dataset(df, path)?;
    finish_with_success(&spinner, &format!("Saved to: {}", path.display()));
    print_step_time(step_start.elapsed());
    Ok(())
}
