//! Terminal output: the aggregate progress bar and run summaries.
//!
//! Uses `indicatif` for the bar and `console` for colours. Log lines go to
//! stderr through `tracing`, so they do not fight with the bar.

use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::persist::{ProgressStats, RecoveryCandidate};
use crate::pool::PoolReport;
use crate::state_machine::{ResultStatus, SearchResult};

/// Progress bar over the items of one pool run.
///
/// Successes count silently; failed items are printed above the bar in red.
#[derive(Clone)]
pub struct PoolProgress {
    bar: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl PoolProgress {
    pub fn start(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(bar)
    }

    /// A bar that draws nothing, for tests and non-interactive runs.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn item_finished(&self, result: &SearchResult) {
        self.bar.inc(1);
        match result.status {
            ResultStatus::Success => {
                self.bar.set_message(format!("last: {}", result.work_item_id));
            }
            ResultStatus::Error | ResultStatus::ErrorInFuture => {
                let reason = result
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                self.bar.println(format!(
                    "  {} {} ({}): {reason}",
                    self.red.apply_to("✗"),
                    result.work_item_id,
                    result.status
                ));
            }
        }
    }

    pub fn cancelling(&self) {
        self.bar.println(format!(
            "  {} Interrupted, finishing in-flight items",
            self.yellow.apply_to("↻")
        ));
    }

    pub fn finish(&self, report: &PoolReport) {
        self.bar.finish_and_clear();
        if self.bar.is_hidden() {
            return;
        }
        let mark = if report.errors() == 0 && report.persist_failures == 0 {
            self.green.apply_to("✓")
        } else {
            self.red.apply_to("✗")
        };
        println!(
            "  {mark} {} processed, {} succeeded, {} errors",
            report.processed, report.succeeded, report.errors()
        );
        if report.not_dispatched > 0 {
            println!(
                "  {} {} items left for a resumed run",
                self.yellow.apply_to("↻"),
                report.not_dispatched
            );
        }
    }
}

/// Final lines of a `run`.
pub fn print_run_summary(report: &PoolReport, results_file: &Path, progress_file: &Path) {
    let bold = Style::new().bold();
    println!();
    println!("{}", bold.apply_to("─── Run Summary ───"));
    println!("Total processed: {}", report.processed);
    println!("Successful:      {}", report.succeeded);
    println!("Errors:          {}", report.errors());
    if report.skipped > 0 {
        println!("Already done:    {}", report.skipped);
    }
    println!("Results file:    {}", results_file.display());
    println!("Progress file:   {}", progress_file.display());
}

/// Output of the `status` subcommand.
pub fn print_status(results_file: &Path, results: &[SearchResult], stats: &ProgressStats) {
    let green = Style::new().green();
    let red = Style::new().red();
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let correct = results.iter().filter(|r| r.found_correct_answer).count();
    println!("{}", results_file.display());
    println!("  results:   {}", results.len());
    println!("  {}", green.apply_to(format!("succeeded: {succeeded}")));
    println!("  {}", red.apply_to(format!("errors:    {}", results.len() - succeeded)));
    println!("  correct:   {correct}");
    println!("  marked:    {}", stats.total_processed);
    match stats.last_updated {
        Some(t) => println!("  updated:   {}", t.to_rfc3339()),
        None => println!("  updated:   never"),
    }
}

/// Output of the `recover` subcommand.
pub fn print_recovery(candidates: &[RecoveryCandidate], total: Option<usize>) {
    if candidates.is_empty() {
        println!("No resumable runs found.");
        return;
    }
    let cyan = Style::new().cyan();
    for (i, c) in candidates.iter().enumerate() {
        println!("{}. {}", i + 1, cyan.apply_to(c.results_file.display()));
        println!("   processed: {}", c.processed_count);
        if let Some(stored) = c.stored_results {
            println!("   stored:    {stored}");
        }
        if let Some(t) = c.last_updated {
            println!("   updated:   {}", t.to_rfc3339());
        }
        if let Some(total) = total {
            println!("   remaining: {}", c.remaining(total));
        }
    }
}
