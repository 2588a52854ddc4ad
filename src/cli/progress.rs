//! Terminal progress display for sync runs
//!
//! Renders the coordinator's [`SyncEvent`] stream as a single indicatif bar
//! whose length grows as each year's plan is fixed. When stderr is not a
//! terminal, or output is quiet, events are only tallied.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::app::coordinator::{ProgressTally, SyncEvent};
use crate::errors::{AppError, Result};

/// Configuration for progress display
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Draw a progress bar
    pub enable_progress_bars: bool,
    /// Spinner tick interval
    pub tick_interval: Duration,
    /// Maximum width for file names in the bar message
    pub max_filename_width: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enable_progress_bars: true,
            tick_interval: Duration::from_millis(120),
            max_filename_width: 40,
        }
    }
}

impl ProgressConfig {
    /// Bars only when requested and stderr is a terminal
    pub fn for_terminal(quiet: bool) -> Self {
        Self {
            enable_progress_bars: !quiet && std::io::stderr().is_terminal(),
            ..Default::default()
        }
    }
}

/// Consumes progress events until the sender side closes
pub struct ProgressDisplay {
    config: ProgressConfig,
}

impl ProgressDisplay {
    pub fn new(config: ProgressConfig) -> Self {
        Self { config }
    }

    /// Spawn the rendering task; it returns the final tally
    ///
    /// # Errors
    ///
    /// Returns an error if the bar template is invalid
    pub fn spawn(self, mut events: mpsc::Receiver<SyncEvent>) -> Result<JoinHandle<ProgressTally>> {
        let bar = if self.config.enable_progress_bars {
            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                    )
                    .map_err(|e| AppError::generic(format!("Progress bar template error: {}", e)))?
                    .progress_chars("##-"),
            );
            bar.enable_steady_tick(self.config.tick_interval);
            Some(bar)
        } else {
            None
        };
        let width = self.config.max_filename_width;

        Ok(tokio::spawn(async move {
            let mut tally = ProgressTally::new();
            while let Some(event) = events.recv().await {
                tally.apply(&event);
                if let Some(bar) = &bar {
                    render(bar, &event, width);
                }
            }
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            debug!(
                "Progress display finished: {} committed, {} failed",
                tally.committed, tally.failed
            );
            tally
        }))
    }
}

fn render(bar: &ProgressBar, event: &SyncEvent, width: usize) {
    match event {
        SyncEvent::YearStarted { year } => bar.set_message(format!("{}: listing", year)),
        SyncEvent::ListingFailed { year, .. } => {
            bar.println(format!("{}: listing unavailable", year));
        }
        SyncEvent::YearPlanned { year, planned, .. } => {
            bar.inc_length(*planned as u64);
            bar.set_message(format!("{}: {} planned", year, planned));
        }
        SyncEvent::FileCommitted { year, file_id, .. } => {
            bar.inc(1);
            bar.set_message(format!("{}: {}", year, truncate(file_id, width)));
        }
        SyncEvent::FileFailed { failure, .. } => {
            bar.inc(1);
            bar.println(format!(
                "failed: {} ({})",
                truncate(&failure.file_id, width),
                failure.kind
            ));
        }
        SyncEvent::YearFinished { year, .. } => bar.set_message(format!("{}: done", year)),
    }
}

fn truncate(name: &str, width: usize) -> String {
    let count = name.chars().count();
    if count > width && width > 3 {
        let tail: String = name.chars().skip(count - (width - 3)).collect();
        format!("...{}", tail)
    } else {
        name.to_string()
    }
}
