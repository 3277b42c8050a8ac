//! Bulk job outcomes and statistics.

use std::fmt;
use std::time::{Duration, Instant};

/// Why an item was not fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The same resource appeared earlier in the job.
    Duplicate,
    /// The job was cancelled before the item finished.
    Cancelled,
}

/// Final state of one job item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Fetched and stored in the current generation.
    Stored {
        /// Payload size in bytes.
        bytes: u64,
    },
    /// Not fetched.
    Skipped(SkipReason),
    /// Fetch or store failed.
    Failed(String),
}

impl ItemOutcome {
    /// Returns true for stored items.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored { bytes } => write!(f, "stored ({bytes} bytes)"),
            Self::Skipped(SkipReason::Duplicate) => f.write_str("skipped (duplicate)"),
            Self::Skipped(SkipReason::Cancelled) => f.write_str("skipped (cancelled)"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of one job item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    /// URL as submitted by the page.
    pub url: String,
    /// Title as submitted by the page.
    pub title: String,
    /// What happened.
    pub outcome: ItemOutcome,
}

/// Summary of a bulk download job.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Per-item results, in submission order.
    pub results: Vec<ItemResult>,
    /// Wall time of the job.
    pub elapsed: Duration,
    /// Whether the job was cancelled before finishing.
    pub cancelled: bool,
}

impl JobReport {
    /// Number of items in the job.
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of stored items.
    #[must_use]
    pub fn stored(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_stored()).count()
    }

    /// Number of skipped items.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Skipped(_)))
            .count()
    }

    /// Number of failed items.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Failed(_)))
            .count()
    }

    /// Total bytes stored.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.results
            .iter()
            .map(|r| match r.outcome {
                ItemOutcome::Stored { bytes } => bytes,
                _ => 0,
            })
            .sum()
    }

    /// Average throughput in bytes per second.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.total_bytes() as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Accumulates item results while a job runs.
pub struct JobReportBuilder {
    start_time: Instant,
    results: Vec<Option<ItemResult>>,
}

impl JobReportBuilder {
    /// Creates a builder for a job of `total` items.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            start_time: Instant::now(),
            results: vec![None; total],
        }
    }

    /// Records the result of the item at `index`.
    pub fn record(&mut self, index: usize, result: ItemResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }

    /// Builds the report. Items never recorded are reported as cancelled.
    #[must_use]
    pub fn build(self, items: &[(String, String)], cancelled: bool) -> JobReport {
        let results = self
            .results
            .into_iter()
            .zip(items)
            .map(|(result, (url, title))| {
                result.unwrap_or_else(|| ItemResult {
                    url: url.clone(),
                    title: title.clone(),
                    outcome: ItemOutcome::Skipped(SkipReason::Cancelled),
                })
            })
            .collect();
        JobReport {
            results,
            elapsed: self.start_time.elapsed(),
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(url: &str, outcome: ItemOutcome) -> ItemResult {
        ItemResult {
            url: url.to_string(),
            title: String::new(),
            outcome,
        }
    }

    #[test]
    fn counts_by_outcome() {
        let report = JobReport {
            results: vec![
                result("/a.mp3", ItemOutcome::Stored { bytes: 100 }),
                result("/b.mp3", ItemOutcome::Failed("status 404".into())),
                result("/a.mp3", ItemOutcome::Skipped(SkipReason::Duplicate)),
                result("/c.mp3", ItemOutcome::Stored { bytes: 50 }),
            ],
            elapsed: Duration::from_secs(3),
            cancelled: false,
        };
        assert_eq!(report.total(), 4);
        assert_eq!(report.stored(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.total_bytes(), 150);
        assert_eq!(report.average_speed(), 50);
    }

    #[test]
    fn average_speed_zero_elapsed() {
        let report = JobReport {
            results: vec![result("/a.mp3", ItemOutcome::Stored { bytes: 100 })],
            elapsed: Duration::ZERO,
            cancelled: false,
        };
        assert_eq!(report.average_speed(), 0);
    }

    #[test]
    fn builder_fills_unrecorded_items_as_cancelled() {
        let items = vec![
            ("/a.mp3".to_string(), "A".to_string()),
            ("/b.mp3".to_string(), "B".to_string()),
        ];
        let mut builder = JobReportBuilder::new(items.len());
        builder.record(0, result("/a.mp3", ItemOutcome::Stored { bytes: 1 }));
        let report = builder.build(&items, true);

        assert!(report.cancelled);
        assert_eq!(report.results[0].outcome, ItemOutcome::Stored { bytes: 1 });
        assert_eq!(report.results[1].url, "/b.mp3");
        assert_eq!(
            report.results[1].outcome,
            ItemOutcome::Skipped(SkipReason::Cancelled)
        );
    }

    #[test]
    fn outcome_display() {
        assert_eq!(ItemOutcome::Stored { bytes: 3 }.to_string(), "stored (3 bytes)");
        assert_eq!(
            ItemOutcome::Failed("offline".into()).to_string(),
            "failed: offline"
        );
    }
}
