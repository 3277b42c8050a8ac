//! Progress bar and summary output for CLI jobs.

use indicatif::{ProgressBar, ProgressStyle};

use crate::downloader::JobProgress;
use crate::entry::EntryInfo;
use crate::format::{format_bytes, format_entry, format_report_problems, format_report_summary};
use crate::message::Song;
use crate::report::{ItemOutcome, ItemResult, JobReport};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates the item-count bar for a bulk job.
pub fn make_job_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {elapsed_precise} - {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("━━╌"),
    );
    bar
}

/// Drives an indicatif bar from bulk job events.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// Wraps `bar`.
    pub const fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl JobProgress for BarProgress {
    fn on_job_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_item_start(&self, song: &Song) {
        let label = if song.title.is_empty() { &song.url } else { &song.title };
        self.bar.set_message(label.clone());
    }

    fn on_item_done(&self, result: &ItemResult, done: usize, _total: usize) {
        self.bar.set_position(done as u64);
        match &result.outcome {
            ItemOutcome::Stored { bytes } => {
                self.bar
                    .println(format!("  {} ({})", result.url, format_bytes(*bytes)));
            }
            ItemOutcome::Failed(reason) => {
                self.bar.println(format!("  {} FAILED: {reason}", result.url));
            }
            ItemOutcome::Skipped(_) => {}
        }
    }

    fn on_job_complete(&self, _report: &JobReport) {
        self.bar.finish_and_clear();
    }
}

/// Prints the job summary.
pub fn print_summary(report: &JobReport) {
    println!("\n{SEPARATOR}");
    println!("Download Summary");
    println!("{SEPARATOR}");
    println!("  {}", format_report_summary(report));
    let problems = format_report_problems(report);
    if !problems.is_empty() {
        print!("{problems}");
    }
    println!("{SEPARATOR}");
}

/// Prints the entries of one generation.
pub fn print_generation(id: &str, current: bool, entries: &[EntryInfo]) {
    let marker = if current { " (current)" } else { "" };
    let total: u64 = entries.iter().map(|e| e.content_length).sum();

    println!("\n{SEPARATOR}");
    println!("{id}{marker}");
    println!("{SEPARATOR}");
    for entry in entries {
        println!("  {}", format_entry(entry));
    }
    println!("{SEPARATOR}");
    let noun = if entries.len() == 1 { "entry" } else { "entries" };
    println!("  {} {noun}, {} total", entries.len(), format_bytes(total));
}
