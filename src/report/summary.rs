//! Result tables for the terminal

use comfy_table::{presets::UTF8_FULL_CONDENSED, Attribute, Cell, Color, Table};
use console::style;

use crate::pipeline::{
    ImbalanceReport, LevelCount, LsattResult, MarginalImbalance, MatchSummary, RegressionResult, RegressionRow,
    RelaxationTable, SweepTable,
};

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect::<Vec<_>>(),
    );
    table
}

fn print_section(icon: &str, title: &str) {
    println!();
    println!("    {} {}", style(icon).cyan(), style(title).white().bold());
    println!("    {}", style("─".repeat(50)).dim());
    println!();
}

fn print_indented(table: &Table) {
    // Indent the table
    for line in table.to_string().lines() {
        println!("    {}", line);
    }
}

fn imbalance_cell(value: f64) -> Cell {
    let color = if value < 0.25 {
        Color::Green
    } else if value < 0.6 {
        Color::Yellow
    } else {
        Color::Red
    };
    Cell::new(format!("{:.4}", value)).fg(color)
}

fn p_value_cell(p: f64) -> Cell {
    let stars = if p <= 0.01 {
        "***"
    } else if p <= 0.05 {
        "**"
    } else if p <= 0.1 {
        "*"
    } else {
        ""
    };
    let cell = Cell::new(format!("{:.4}{}", p, stars));
    if p <= 0.05 {
        cell.fg(Color::Green)
    } else {
        cell
    }
}

fn format_counts(counts: &[LevelCount]) -> String {
    if counts.is_empty() {
        return "-".to_string();
    }
    counts
        .iter()
        .map(|c| format!("{}: {}", c.level, c.count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top `top` grid points by imbalance.
pub fn relaxation_table(table: &RelaxationTable, top: usize) -> Table {
    let mut out = new_table(&["#", "Imbalance", "Coarsening", "Bins", "Retained"]);
    for row in table.ranked().into_iter().take(top) {
        out.add_row(vec![
            Cell::new(row.index),
            imbalance_cell(row.imbalance.value()),
            Cell::new(row.coarsening.to_string()),
            Cell::new(row.bins),
            Cell::new(format_counts(&row.treatment_counts)),
        ]);
    }
    out
}

pub fn display_relaxation(table: &RelaxationTable, top: usize) {
    print_section("📋", "RELAXATION RESULTS");
    let degenerate = table.iter().filter(|r| r.treatment_counts.is_empty()).count();
    println!(
        "      {} coarsenings evaluated, {} without any match",
        style(table.len()).yellow().bold(),
        style(degenerate).yellow()
    );
    println!();
    print_indented(&relaxation_table(table, top));
}

pub fn match_table(summary: &MatchSummary) -> Table {
    let mut out = new_table(&["Treatment", "All", "Matched"]);
    for all in &summary.all {
        let matched = summary
            .matched
            .iter()
            .find(|m| m.level == all.level)
            .map_or(0, |m| m.count);
        let reference = summary.reference == Some(all.level);
        out.add_row(vec![
            Cell::new(if reference {
                format!("{} (reference)", all.level)
            } else {
                all.level.to_string()
            }),
            Cell::new(all.count),
            Cell::new(matched).fg(if matched > 0 { Color::Green } else { Color::Red }),
        ]);
    }
    out.add_row(vec![
        Cell::new("Strata").add_attribute(Attribute::Bold),
        Cell::new(summary.strata),
        Cell::new(summary.matched_strata).add_attribute(Attribute::Bold),
    ]);
    out
}

pub fn display_match(summary: &MatchSummary) {
    print_section("📋", "MATCH SUMMARY");
    print_indented(&match_table(summary));
}

pub fn coefficient_table(result: &RegressionResult) -> Table {
    let mut out = new_table(&["Term", "Coef", "Std Err", "z", "P>|z|", "[0.025", "0.975]"]);
    for c in &result.coefficients {
        out.add_row(vec![
            Cell::new(&c.term),
            Cell::new(format!("{:.4}", c.coef)).add_attribute(Attribute::Bold),
            Cell::new(format!("{:.4}", c.std_err)),
            Cell::new(format!("{:.3}", c.z)),
            p_value_cell(c.p_value),
            Cell::new(format!("{:.4}", c.ci_low)),
            Cell::new(format!("{:.4}", c.ci_high)),
        ]);
    }
    out
}

pub fn display_regression(row: &RegressionRow) {
    print_section("📋", "WEIGHTED REGRESSION");
    println!(
        "      Imbalance: {}   Matched: {}",
        style(row.imbalance.to_string()).yellow().bold(),
        format_counts(&row.treatment_counts)
    );
    match &row.result {
        Some(result) => {
            println!(
                "      {}   n = {}   log-likelihood = {:.3}   deviance = {:.3}",
                style(&result.formula).dim(),
                result.n_obs,
                result.log_likelihood,
                result.deviance
            );
            println!();
            print_indented(&coefficient_table(result));
        }
        None => println!("      {}", style("No stratum matched; nothing was fitted").red()),
    }
}

pub fn sweep_table(table: &SweepTable) -> Table {
    let terms: Vec<String> = table
        .rows()
        .iter()
        .find_map(|step| step.row.result.as_ref())
        .map(|r| r.coefficients.iter().map(|c| c.term.clone()).collect())
        .unwrap_or_default();

    let mut headers = vec!["Bins", "Imbalance", "Observations"];
    headers.extend(terms.iter().map(String::as_str));
    let mut out = new_table(&headers);

    let samples = table.coarsenings();
    for (step, sample) in table.rows().iter().zip(&samples) {
        let mut cells = vec![
            Cell::new(step.n_bins),
            imbalance_cell(sample.imbalance),
            Cell::new(sample.observations),
        ];
        for term in &terms {
            let cell = if step.row.error.is_some() {
                Cell::new("failed").fg(Color::Red)
            } else {
                step.row
                    .result
                    .as_ref()
                    .and_then(|r| r.coefficient(term))
                    .map_or_else(|| Cell::new("-"), |c| Cell::new(format!("{:.4}", c.coef)))
            };
            cells.push(cell);
        }
        out.add_row(cells);
    }
    out
}

pub fn display_sweep(table: &SweepTable) {
    print_section("📋", "PROGRESSIVE COARSENING");
    if let Some(covariate) = table.rows().first().map(|s| s.covariate.as_str()) {
        println!("      Coefficients by number of bins for {}", style(covariate).cyan().bold());
        println!();
    }
    print_indented(&sweep_table(table));
    for step in table.rows() {
        if let Some(error) = &step.row.error {
            println!("      {} {} bins: {}", style("⚠").yellow(), step.n_bins, style(error).dim());
        }
    }
}

pub fn display_imbalance(report: &ImbalanceReport, marginal: Option<&[MarginalImbalance]>) {
    print_section("📋", "IMBALANCE");
    println!(
        "      Multivariate L1: {}",
        style(report.score.to_string()).yellow().bold()
    );
    println!();

    let mut table = new_table(&["Covariate", "Hist. bins", "Range", "Marginal L1"]);
    for (i, covariate) in report.params.covariates.iter().enumerate() {
        let bins = report.params.bins.get(i).map_or("-".to_string(), |b| b.to_string());
        let range = report
            .params
            .ranges
            .get(i)
            .map_or("-".to_string(), |(lo, hi)| format!("[{}, {}]", lo, hi));
        let marginal_cell = marginal
            .and_then(|m| m.iter().find(|m| &m.covariate == covariate))
            .map_or_else(|| Cell::new("-"), |m| imbalance_cell(m.imbalance.value()));
        table.add_row(vec![Cell::new(covariate), Cell::new(bins), Cell::new(range), marginal_cell]);
    }
    print_indented(&table);
}

pub fn lsatt_table(result: &LsattResult) -> Table {
    let mut out = new_table(&["Treatment", "N", "Total weight", "Weighted mean", "Weighted std"]);
    for level in &result.levels {
        out.add_row(vec![
            Cell::new(level.level),
            Cell::new(level.count),
            Cell::new(format!("{:.3}", level.total_weight)),
            Cell::new(format!("{:.4}", level.weighted_mean)).add_attribute(Attribute::Bold),
            Cell::new(format!("{:.4}", level.weighted_std)),
        ]);
    }
    out
}

pub fn display_lsatt(result: &LsattResult) {
    print_section("📋", "LSATT");
    print_indented(&lsatt_table(result));
    println!();
    println!(
        "      Effect: {}   Welch t = {:.4}   df = {:.2}   p = {:.4}",
        style(format!("{:.4}", result.effect())).green().bold(),
        result.test.statistic,
        result.test.df,
        result.test.p_value
    );
}
