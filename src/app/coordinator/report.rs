//! Per-year and per-run outcome reporting
//!
//! Per-file failures never abort a run; they are collected here together with
//! the counts of files that were committed, left alone by the load policy or
//! deferred by the sample cap.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::models::LoadMode;

/// Stage at which a file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Download,
    Decompress,
    Write,
    /// The worker panicked while handling the file
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Download => "download",
            FailureKind::Decompress => "decompress",
            FailureKind::Write => "write",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// One failed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub file_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// Outcome of one year
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct YearReport {
    pub year: i32,
    /// Files in the year's plan
    pub planned: usize,
    /// Files committed this run
    pub succeeded: usize,
    pub failed: Vec<FileFailure>,
    /// Listed files the load policy left alone
    pub skipped: usize,
    /// Files cut by the sample cap
    pub deferred: usize,
    /// Set when the year's listing could not be fetched or parsed
    pub listing_error: Option<String>,
    /// The run was cancelled before every planned file finished
    pub cancelled: bool,
}

impl YearReport {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            ..Default::default()
        }
    }

    pub fn listing_unavailable(year: i32, reason: impl Into<String>) -> Self {
        Self {
            year,
            listing_error: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Planned files with no outcome because of cancellation
    pub fn unfinished(&self) -> usize {
        self.planned
            .saturating_sub(self.succeeded + self.failed.len())
    }

    /// Every planned file committed and the listing was available
    pub fn is_clean(&self) -> bool {
        self.listing_error.is_none() && self.failed.is_empty() && !self.cancelled
    }
}

impl fmt::Display for YearReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.listing_error {
            return write!(f, "{}: listing unavailable ({})", self.year, reason);
        }
        write!(
            f,
            "{}: {} planned, {} succeeded, {} failed, {} skipped",
            self.year,
            self.planned,
            self.succeeded,
            self.failed.len(),
            self.skipped
        )?;
        if self.deferred > 0 {
            write!(f, ", {} deferred", self.deferred)?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: LoadMode,
    pub years: Vec<YearReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn new(mode: LoadMode) -> Self {
        let now = Utc::now();
        Self {
            mode,
            years: Vec::new(),
            started_at: now,
            finished_at: now,
            cancelled: false,
        }
    }

    pub fn year(&self, year: i32) -> Option<&YearReport> {
        self.years.iter().find(|y| y.year == year)
    }

    pub fn total_planned(&self) -> usize {
        self.years.iter().map(|y| y.planned).sum()
    }

    pub fn total_succeeded(&self) -> usize {
        self.years.iter().map(|y| y.succeeded).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.years.iter().map(|y| y.failed.len()).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.years.iter().map(|y| y.skipped).sum()
    }

    pub fn total_deferred(&self) -> usize {
        self.years.iter().map(|y| y.deferred).sum()
    }

    /// Years whose listing was unavailable
    pub fn unavailable_years(&self) -> Vec<i32> {
        self.years
            .iter()
            .filter(|y| y.listing_error.is_some())
            .map(|y| y.year)
            .collect()
    }

    /// All failures across years
    pub fn failures(&self) -> impl Iterator<Item = (i32, &FileFailure)> {
        self.years
            .iter()
            .flat_map(|y| y.failed.iter().map(move |f| (y.year, f)))
    }

    pub fn duration(&self) -> std::time::Duration {
        self.finished_at
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} run over {} year(s): {} succeeded, {} failed, {} skipped",
            self.mode,
            self.years.len(),
            self.total_succeeded(),
            self.total_failed(),
            self.total_skipped()
        );
        let deferred = self.total_deferred();
        if deferred > 0 {
            summary.push_str(&format!(", {} deferred", deferred));
        }
        let unavailable = self.unavailable_years().len();
        if unavailable > 0 {
            summary.push_str(&format!(", {} listing(s) unavailable", unavailable));
        }
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(file_id: &str, kind: FailureKind) -> FileFailure {
        FileFailure {
            file_id: file_id.to_string(),
            kind,
            message: "HTTP 404".to_string(),
            attempts: 1,
        }
    }

    #[test]
    fn test_totals_across_years() {
        let mut report = RunReport::new(LoadMode::Incremental);
        report.years.push(YearReport {
            planned: 3,
            succeeded: 2,
            failed: vec![failure("010014-99999-2022.op.gz", FailureKind::Download)],
            skipped: 10,
            ..YearReport::new(2022)
        });
        report.years.push(YearReport {
            planned: 1,
            succeeded: 1,
            deferred: 4,
            ..YearReport::new(2023)
        });
        report
            .years
            .push(YearReport::listing_unavailable(2024, "HTTP 503"));

        assert_eq!(report.total_planned(), 4);
        assert_eq!(report.total_succeeded(), 3);
        assert_eq!(report.total_failed(), 1);
        assert_eq!(report.total_skipped(), 10);
        assert_eq!(report.total_deferred(), 4);
        assert_eq!(report.unavailable_years(), vec![2024]);
        assert_eq!(report.failures().count(), 1);

        let summary = report.summary();
        assert!(summary.contains("3 succeeded"));
        assert!(summary.contains("1 listing(s) unavailable"));
    }

    #[test]
    fn test_year_report_display() {
        let year = YearReport {
            planned: 2,
            succeeded: 1,
            cancelled: true,
            ..YearReport::new(2023)
        };
        assert_eq!(year.unfinished(), 1);
        assert!(!year.is_clean());
        assert_eq!(
            year.to_string(),
            "2023: 2 planned, 1 succeeded, 0 failed, 0 skipped (cancelled)"
        );

        let unavailable = YearReport::listing_unavailable(1950, "HTTP 500");
        assert_eq!(unavailable.to_string(), "1950: listing unavailable (HTTP 500)");
    }

    #[test]
    fn test_report_serializes() {
        let mut report = RunReport::new(LoadMode::Historical);
        report.years.push(YearReport {
            planned: 1,
            failed: vec![failure("010010-99999-2023.op.gz", FailureKind::Write)],
            ..YearReport::new(2023)
        });

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"kind\":\"write\""));
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
