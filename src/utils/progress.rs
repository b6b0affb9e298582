//! Progress bar helpers using indicatif

use indicatif::{ProgressBar, ProgressStyle};

/// Create a spinner for indeterminate progress (loading, saving)
pub fn create_spinner(message: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Create a progress bar over `len` grid points or sweep steps.
///
/// A hidden bar is returned when `visible` is false so callers can tick it
/// unconditionally.
pub fn create_progress_bar(len: u64, message: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("█▓▒░"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Finish a progress bar with a success message
pub fn finish_with_success(pb: &ProgressBar, message: &str) {
    pb.finish_with_message(format!("✅ {}", message));
}

/// Finish a progress bar with a warning message
pub fn finish_with_warning(pb: &ProgressBar, message: &str) {
    pb.finish_with_message(format!("⚠️  {}", message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_still_counts() {
        let pb = create_progress_bar(3, "relaxing", false);
        pb.inc(2);
        assert_eq!(pb.position(), 2);
        assert!(pb.is_hidden());
    }

    #[test]
    fn test_quiet_spinner_is_hidden() {
        let spinner = create_spinner("loading", false);
        assert!(spinner.is_hidden());
        finish_with_success(&spinner, "done");
    }

    #[test]
    fn test_finish_with_warning_keeps_message() {
        let pb = create_progress_bar(2, "regressing", false);
        pb.inc(2);
        finish_with_warning(&pb, "1 of 2 fits failed");
        assert!(pb.is_finished());
        assert!(pb.message().contains("1 of 2 fits failed"));
    }
}
