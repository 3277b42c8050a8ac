//! Human-readable rendering of sizes, durations, job reports and entries.

use std::fmt::Write as _;
use std::time::Duration;

use crate::entry::EntryInfo;
use crate::report::{ItemOutcome, JobReport};

const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

/// Formats a byte count with binary units ("512 B", "1.50 MB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats a throughput in bytes per second.
#[must_use]
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Formats a duration ("0.4s", "2m 07s", "1h 00m 03s").
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..60 => format!("{secs}.{}s", d.subsec_millis() / 100),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60),
    }
}

/// One-line summary of a bulk job.
#[must_use]
pub fn format_report_summary(report: &JobReport) -> String {
    let mut line = format!(
        "{}/{} stored, {} failed, {} skipped, {} in {} ({})",
        report.stored(),
        report.total(),
        report.failed(),
        report.skipped(),
        format_bytes(report.total_bytes()),
        format_duration(report.elapsed),
        format_speed(report.average_speed()),
    );
    if report.cancelled {
        line.push_str(" [cancelled]");
    }
    line
}

/// Multi-line listing of the items that were not stored.
#[must_use]
pub fn format_report_problems(report: &JobReport) -> String {
    let mut out = String::new();
    for result in report
        .results
        .iter()
        .filter(|r| !matches!(r.outcome, ItemOutcome::Stored { .. }))
    {
        let label = if result.title.is_empty() {
            result.url.as_str()
        } else {
            result.title.as_str()
        };
        let _ = writeln!(out, "  {label}: {}", result.outcome);
    }
    out
}

/// One line describing a stored entry: key, size, type, age.
#[must_use]
pub fn format_entry(info: &EntryInfo) -> String {
    let content_type = info.content_type.as_deref().unwrap_or("-");
    let opaque = if info.opaque { " opaque" } else { "" };
    format!(
        "{:>10}  {:<24}  {}  {}{opaque}",
        format_bytes(info.content_length),
        content_type,
        info.stored_at.format("%Y-%m-%d %H:%M:%S"),
        info.key,
    )
}
