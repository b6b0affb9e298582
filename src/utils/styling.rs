//! Terminal styling utilities for the command-line front end

use console::{style, Emoji};
use std::path::Path;
use std::time::Duration;

// Emoji icons with fallbacks for terminals that don't support them
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "[*] ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", ">> ");
pub static CHART: Emoji<'_, '_> = Emoji("📊 ", "");
pub static FOLDER: Emoji<'_, '_> = Emoji("📂 ", "");
pub static TARGET: Emoji<'_, '_> = Emoji("🎯 ", "");
pub static GRID: Emoji<'_, '_> = Emoji("🧮 ", "");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!] ");

const CARD_WIDTH: usize = 56;

/// Print the application banner
pub fn print_banner(version: &str) {
    let banner = r#"
     ██████╗███████╗███╗   ███╗
    ██╔════╝██╔════╝████╗ ████║
    ██║     █████╗  ██╔████╔██║
    ██║     ██╔══╝  ██║╚██╔╝██║
    ╚██████╗███████╗██║ ╚═╝ ██║
     ╚═════╝╚══════╝╚═╝     ╚═╝
    "#;

    println!();
    println!("{}", style(banner).cyan().bold());
    println!(
        "    {} {}",
        style("≈").magenta().bold(),
        style("Coarsened Exact Matching").dim()
    );
    println!("    {}", style(format!("v{}", version)).dim());
    println!("    {}", style("━".repeat(50)).dim());
    println!();
}

/// Print configuration card: input, treatment and any extra `(label, value)` settings
pub fn print_config(input: &Path, treatment: &str, settings: &[(&str, String)]) {
    let line = "─".repeat(CARD_WIDTH - 2);

    println!("    ┌{}┐", line);
    println!(
        "    │ {}{}│",
        style("⚙️  Configuration").cyan().bold(),
        " ".repeat(CARD_WIDTH - 20)
    );
    println!("    ├{}┤", line);
    println!("    │  {} Input:     {:<36}│", FOLDER, truncate_path(input, 35));
    println!("    │  {} Treatment: {:<36}│", TARGET, truncate_string(treatment, 35));
    if !settings.is_empty() {
        println!("    ├{}┤", line);
        for (label, value) in settings {
            println!(
                "    │  {} {:<12} {:<35}│",
                GRID,
                format!("{}:", label),
                style(truncate_string(value, 34)).yellow()
            );
        }
    }
    println!("    └{}┘", line);
    println!();
}

/// Print a step header with styling
pub fn print_step_header(step_num: u8, title: &str) {
    println!();
    println!(
        "    {} {} {}",
        style(format!("STEP {}", step_num)).cyan().bold(),
        style("│").dim(),
        style(title).white().bold()
    );
    println!("    {}", style("─".repeat(50)).dim());
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("    {} {}", style("✓").green().bold(), style(message).green());
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("    {} {}", INFO, message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("    {} {}", WARN, style(message).yellow());
}

/// Print the elapsed time of a step
pub fn print_step_time(elapsed: Duration) {
    println!("    {}", style(format!("({:.2}s)", elapsed.as_secs_f64())).dim());
}

/// Print the final completion message
pub fn print_completion() {
    println!();
    println!("    {} {}", ROCKET, style("CEM run complete!").green().bold());
    println!();
}

/// Print a styled count message
pub fn print_count(description: &str, count: usize, detail: Option<&str>) {
    if let Some(info) = detail {
        println!(
            "      {} {} {} {}",
            CHART,
            style(count).yellow().bold(),
            description,
            style(info).dim()
        );
    } else {
        println!("      {} {} {}", CHART, style(count).yellow().bold(), description);
    }
}

// Helper functions

fn truncate_path(path: &Path, max_len: usize) -> String {
    let path_str = path.display().to_string();
    truncate_string(&path_str, max_len)
}

fn truncate_string(s: &str, max_len: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len {
        s.to_string()
    } else {
        let tail: String = chars[chars.len() - (max_len - 3)..].iter().collect();
        format!("...{}", tail)
    }
}
