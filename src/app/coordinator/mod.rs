//! Run orchestration across years
//!
//! The coordinator drives each requested year through
//! Listing → Planning → Fetching/Writing → Reporting:
//!
//! - the year's listing is fetched; if it is unavailable only that year is
//!   abandoned and recorded in the report
//! - a plan is computed once from a ledger snapshot before any fetch
//! - planned files go through a bounded [`WorkerPool`]
//! - per-file results are folded into a [`YearReport`]
//!
//! Years run sequentially. Only a ledger failure aborts the run, since no
//! further progress could be recorded.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gsod_sync::app::{
//!     build_transport, ArchiveFetcher, ClientConfig, CoordinatorConfig, DirectoryLister,
//!     IngestionLedger, LayoutResolver, LoadMode, RetryPolicy, RunRequest, StoreWriter,
//!     SyncCoordinator,
//! };
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let base_url = Url::parse("https://www1.ncdc.noaa.gov/pub/data/gsod/")?;
//! let transport = build_transport(&ClientConfig::default())?;
//! let ledger = Arc::new(IngestionLedger::open("data/ledger/ingestion.jsonl").await?);
//!
//! let coordinator = SyncCoordinator::new(
//!     CoordinatorConfig::default(),
//!     DirectoryLister::new(transport.clone(), base_url.clone()),
//!     ArchiveFetcher::new(transport, base_url, RetryPolicy::default()),
//!     StoreWriter::local(),
//!     ledger,
//! );
//!
//! let resolver = LayoutResolver::Local { root: "data/raw".into() };
//! let report = coordinator
//!     .run(&RunRequest::new(vec![2023], LoadMode::Incremental), &resolver)
//!     .await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod progress;
pub mod report;
pub mod signals;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::client::{ArchiveFetcher, DirectoryLister};
use crate::app::ledger::IngestionLedger;
use crate::app::models::{ArchiveName, LoadMode, RemoteListing, SyncPlan, YearEntry};
use crate::app::planner;
use crate::app::resources::{self, ReferenceResource, ResourceOutcome};
use crate::app::store::{DestinationResolver, StoreWriter};
use crate::app::worker::{FileOutcome, FileTask, WorkerPool};
use crate::errors::{LedgerResult, ListingResult};

pub use config::CoordinatorConfig;
pub use progress::{ProgressTally, SyncEvent};
pub use report::{FailureKind, FileFailure, RunReport, YearReport};
pub use signals::{CancelHandle, SignalHandler};

/// What a run should cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Years to process, in order; duplicates are processed once
    pub years: Vec<i32>,
    pub mode: LoadMode,
    /// Per-year cap on planned files
    pub sample_cap: Option<usize>,
    /// When non-empty, only these archive names are considered
    pub file_filter: Vec<String>,
}

impl RunRequest {
    pub fn new(years: Vec<i32>, mode: LoadMode) -> Self {
        Self {
            years,
            mode,
            sample_cap: None,
            file_filter: Vec::new(),
        }
    }

    /// Request covering only the named archives, in the years their names carry
    ///
    /// Names that do not follow the archive pattern are ignored.
    pub fn for_files(file_names: &[String], mode: LoadMode) -> Self {
        let mut years = Vec::new();
        let mut files = Vec::new();
        for name in file_names {
            match ArchiveName::parse(name) {
                Some(archive) => {
                    if !years.contains(&archive.year) {
                        years.push(archive.year);
                    }
                    files.push(name.clone());
                }
                None => warn!("Ignoring {}: not a GSOD archive name", name),
            }
        }
        Self {
            years,
            mode,
            sample_cap: None,
            file_filter: files,
        }
    }

    pub fn with_sample_cap(mut self, sample_cap: Option<usize>) -> Self {
        self.sample_cap = sample_cap;
        self
    }

    pub fn with_file_filter(mut self, file_filter: Vec<String>) -> Self {
        self.file_filter = file_filter;
        self
    }
}

/// Orchestrates listing, planning, download and ledger updates for a run
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    lister: DirectoryLister,
    fetcher: ArchiveFetcher,
    store: StoreWriter,
    ledger: Arc<IngestionLedger>,
    cancel: CancelHandle,
    events: Option<mpsc::Sender<SyncEvent>>,
}

impl SyncCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        lister: DirectoryLister,
        fetcher: ArchiveFetcher,
        store: StoreWriter,
        ledger: Arc<IngestionLedger>,
    ) -> Self {
        Self {
            config,
            lister,
            fetcher,
            store,
            ledger,
            cancel: CancelHandle::new(),
            events: None,
        }
    }

    /// Emit progress events on `events`
    pub fn with_progress(mut self, events: mpsc::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share an existing cancellation flag
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels this coordinator's runs
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<IngestionLedger> {
        &self.ledger
    }

    async fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    /// Years on the server, optionally only those changed since `changed_since`
    pub async fn discover_years(
        &self,
        changed_since: Option<DateTime<Utc>>,
    ) -> ListingResult<Vec<YearEntry>> {
        self.lister.list_years(changed_since).await
    }

    /// List `year` and plan it against the current ledger without downloading
    pub async fn plan_year(
        &self,
        year: i32,
        mode: LoadMode,
        sample_cap: Option<usize>,
        file_filter: &[String],
    ) -> ListingResult<SyncPlan> {
        let listing = self.lister.list(year).await?;
        let listing = apply_file_filter(listing, file_filter);
        let snapshot = self.ledger.snapshot().await;
        Ok(planner::plan(&listing, &snapshot, mode, sample_cap))
    }

    /// Download the reference resources into `output_dir`
    pub async fn fetch_resources(
        &self,
        resources: &[ReferenceResource],
        output_dir: &Path,
    ) -> Vec<ResourceOutcome> {
        resources::fetch_all(
            &self.fetcher,
            &self.store,
            resources,
            output_dir,
            &self.cancel.subscribe(),
        )
        .await
    }

    /// Run the requested years
    ///
    /// Listing, download, decompression and write failures are recorded in
    /// the report. Years not reached before cancellation have no entry.
    ///
    /// # Errors
    ///
    /// Returns the ledger error that stopped the run
    pub async fn run(
        &self,
        request: &RunRequest,
        resolver: &dyn DestinationResolver,
    ) -> LedgerResult<RunReport> {
        let mut report = RunReport::new(request.mode);
        let mut seen = HashSet::new();
        info!(
            "Starting {} sync of {} year(s) with {} workers",
            request.mode,
            request.years.len(),
            self.config.worker_count
        );

        for &year in &request.years {
            if !seen.insert(year) {
                continue;
            }
            if self.cancel.is_cancelled() {
                info!("Run cancelled before year {}", year);
                break;
            }

            let year_report = match self.run_year(year, request, resolver).await {
                Ok(year_report) => year_report,
                Err(e) => {
                    error!("Ledger failure during year {}: {}", year, e);
                    return Err(e);
                }
            };
            info!("{}", year_report);
            report.years.push(year_report);
        }

        report.cancelled = self.cancel.is_cancelled();

        if self.config.compact_after_run {
            self.ledger.compact().await?;
        }

        report.finished_at = Utc::now();
        info!("{}", report.summary());
        Ok(report)
    }

    async fn run_year(
        &self,
        year: i32,
        request: &RunRequest,
        resolver: &dyn DestinationResolver,
    ) -> LedgerResult<YearReport> {
        self.emit(SyncEvent::YearStarted { year }).await;

        let listing = match self.lister.list(year).await {
            Ok(listing) => apply_file_filter(listing, &request.file_filter),
            Err(e) => {
                warn!("Skipping year {}: {}", year, e);
                self.emit(SyncEvent::ListingFailed {
                    year,
                    reason: e.to_string(),
                })
                .await;
                return Ok(YearReport::listing_unavailable(year, e.to_string()));
            }
        };

        let snapshot = self.ledger.snapshot().await;
        let plan = planner::plan(&listing, &snapshot, request.mode, request.sample_cap);
        debug!(
            "Year {}: {} listed, {} planned, {} skipped, {} deferred",
            year,
            listing.len(),
            plan.len(),
            plan.skipped_count,
            plan.deferred_count
        );
        self.emit(SyncEvent::YearPlanned {
            year,
            planned: plan.len(),
            skipped: plan.skipped_count,
            deferred: plan.deferred_count,
        })
        .await;

        let mut year_report = YearReport {
            planned: plan.len(),
            skipped: plan.skipped_count,
            deferred: plan.deferred_count,
            ..YearReport::new(year)
        };

        let tasks: Vec<FileTask> = plan
            .to_download
            .into_iter()
            .map(|entry| FileTask {
                year,
                destination: resolver.resolve(year, &entry.file_name),
                entry,
            })
            .collect();

        let mut pool = WorkerPool::new(
            self.fetcher.clone(),
            self.store.clone(),
            self.ledger.clone(),
            self.config.worker_count,
        );
        if let Some(events) = &self.events {
            pool = pool.with_events(events.clone());
        }

        for result in pool.run(tasks, self.cancel.subscribe()).await? {
            match result.outcome {
                FileOutcome::Committed(_) => year_report.succeeded += 1,
                FileOutcome::Failed(failure) => year_report.failed.push(failure),
                FileOutcome::Cancelled => {}
            }
        }
        year_report
            .failed
            .sort_by(|a, b| a.file_id.cmp(&b.file_id));
        year_report.cancelled = self.cancel.is_cancelled() && year_report.unfinished() > 0;

        self.emit(SyncEvent::YearFinished {
            year,
            succeeded: year_report.succeeded,
            failed: year_report.failed.len(),
        })
        .await;

        Ok(year_report)
    }
}

/// Keep only the named archives; an empty filter keeps everything
fn apply_file_filter(listing: RemoteListing, file_filter: &[String]) -> RemoteListing {
    if file_filter.is_empty() {
        return listing;
    }
    let entries = listing
        .entries
        .into_iter()
        .filter(|entry| file_filter.iter().any(|name| name == entry.file_id()))
        .collect();
    RemoteListing::new(listing.year, entries)
}
