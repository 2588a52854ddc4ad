//! Progress events emitted while a run is in flight
//!
//! The coordinator and its workers send [`SyncEvent`]s over an optional
//! bounded channel. [`ProgressTally`] folds them into running totals for
//! display.

use super::report::FileFailure;

/// Run progress notification
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A year's listing is being fetched
    YearStarted { year: i32 },
    /// The year's listing could not be fetched or parsed
    ListingFailed { year: i32, reason: String },
    /// The year's plan is fixed
    YearPlanned {
        year: i32,
        planned: usize,
        skipped: usize,
        deferred: usize,
    },
    FileCommitted {
        year: i32,
        file_id: String,
        bytes: u64,
    },
    FileFailed { year: i32, failure: FileFailure },
    YearFinished {
        year: i32,
        succeeded: usize,
        failed: usize,
    },
}

impl SyncEvent {
    pub fn year(&self) -> i32 {
        match self {
            SyncEvent::YearStarted { year }
            | SyncEvent::ListingFailed { year, .. }
            | SyncEvent::YearPlanned { year, .. }
            | SyncEvent::FileCommitted { year, .. }
            | SyncEvent::FileFailed { year, .. }
            | SyncEvent::YearFinished { year, .. } => *year,
        }
    }
}

/// Running totals derived from progress events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTally {
    pub current_year: Option<i32>,
    pub years_finished: usize,
    pub planned: usize,
    pub committed: usize,
    pub failed: usize,
    pub bytes_written: u64,
}

impl ProgressTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::YearStarted { year } => self.current_year = Some(*year),
            SyncEvent::ListingFailed { .. } => self.years_finished += 1,
            SyncEvent::YearPlanned { planned, .. } => self.planned += planned,
            SyncEvent::FileCommitted { bytes, .. } => {
                self.committed += 1;
                self.bytes_written += bytes;
            }
            SyncEvent::FileFailed { .. } => self.failed += 1,
            SyncEvent::YearFinished { .. } => self.years_finished += 1,
        }
    }

    /// Files finished either way
    pub fn processed(&self) -> usize {
        self.committed + self.failed
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.planned == 0 {
            return 0.0;
        }
        (self.processed() as f64 / self.planned as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::coordinator::report::FailureKind;

    #[test]
    fn test_tally_folds_events() {
        let events = vec![
            SyncEvent::YearStarted { year: 2023 },
            SyncEvent::YearPlanned {
                year: 2023,
                planned: 4,
                skipped: 1,
                deferred: 0,
            },
            SyncEvent::FileCommitted {
                year: 2023,
                file_id: "010010-99999-2023.op.gz".to_string(),
                bytes: 100,
            },
            SyncEvent::FileFailed {
                year: 2023,
                failure: FileFailure {
                    file_id: "010014-99999-2023.op.gz".to_string(),
                    kind: FailureKind::Decompress,
                    message: "invalid gzip header".to_string(),
                    attempts: 1,
                },
            },
            SyncEvent::YearFinished {
                year: 2023,
                succeeded: 1,
                failed: 1,
            },
            SyncEvent::YearStarted { year: 2024 },
            SyncEvent::ListingFailed {
                year: 2024,
                reason: "HTTP 503".to_string(),
            },
        ];

        let mut tally = ProgressTally::new();
        for event in &events {
            tally.apply(event);
        }

        assert_eq!(tally.current_year, Some(2024));
        assert_eq!(tally.years_finished, 2);
        assert_eq!(tally.planned, 4);
        assert_eq!(tally.processed(), 2);
        assert_eq!(tally.bytes_written, 100);
        assert!((tally.completion_percentage() - 50.0).abs() < f64::EPSILON);
        assert_eq!(events[6].year(), 2024);
    }

    #[test]
    fn test_empty_tally_percentage() {
        assert_eq!(ProgressTally::new().completion_percentage(), 0.0);
    }
}
