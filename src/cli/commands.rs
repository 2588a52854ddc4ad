//! Command handlers for GSOD Sync CLI
//!
//! This module implements the command handlers that turn CLI arguments and
//! the resolved configuration into engine components and print the results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::app::client::{ArchiveTransport, HttpHandler};
use crate::app::coordinator::{CancelHandle, RunReport, SignalHandler};
use crate::app::models::{IngestionStatus, LoadMode};
use crate::app::resources::{self, ResourceOutcome};
use crate::app::{
    build_store_writer, ArchiveFetcher, DirectoryLister, IngestionLedger, LayoutResolver,
    RunRequest, StoreWriter, SyncCoordinator,
};
use crate::cli::{
    ConfigAction, ConfigArgs, LedgerAction, LedgerArgs, PlanArgs, ProgressConfig,
    ProgressDisplay, SyncArgs, YearsArgs,
};
use crate::config::AppConfig;
use crate::constants::config as config_files;
use crate::errors::{AppError, Result};

/// How many plan entries `plan` prints before summarising
const PLAN_PREVIEW_LIMIT: usize = 20;

/// Network-facing components shared by the commands
struct Components {
    transport: Arc<dyn ArchiveTransport>,
    store: StoreWriter,
    base_url: Url,
}

impl Components {
    fn build(config: &AppConfig) -> Result<Self> {
        let client_config = config.client_config();
        let http_client = client_config.build_http_client()?;
        let transport: Arc<dyn ArchiveTransport> = Arc::new(HttpHandler::new(
            http_client.clone(),
            client_config.rate_limit_rps,
        )?);
        let store = build_store_writer(&config.storage, http_client)?;

        Ok(Self {
            transport,
            store,
            base_url: config.base_url()?,
        })
    }

    fn lister(&self) -> DirectoryLister {
        DirectoryLister::new(self.transport.clone(), self.base_url.clone())
    }

    fn fetcher(&self, config: &AppConfig) -> ArchiveFetcher {
        ArchiveFetcher::new(
            self.transport.clone(),
            self.base_url.clone(),
            config.retry_policy(),
        )
    }

    /// Coordinator over the configured ledger
    async fn coordinator(
        &self,
        config: &AppConfig,
        worker_override: Option<usize>,
    ) -> Result<SyncCoordinator> {
        let ledger = Arc::new(IngestionLedger::open(&config.ledger.path).await?);
        let mut coordinator_config = config.coordinator_config();
        if let Some(workers) = worker_override {
            coordinator_config = coordinator_config.with_worker_count(workers);
        }

        Ok(SyncCoordinator::new(
            coordinator_config,
            self.lister(),
            self.fetcher(config),
            self.store.clone(),
            ledger,
        ))
    }
}

fn changed_since(window: Option<Duration>) -> Result<Option<DateTime<Utc>>> {
    window
        .map(|window| {
            chrono::Duration::from_std(window)
                .map(|window| Utc::now() - window)
                .map_err(|e| AppError::generic(format!("Invalid --changed-since window: {}", e)))
        })
        .transpose()
}

/// Handle the sync command
///
/// Resolves the years, runs the coordinator with progress display and
/// signal handling, and prints the per-year report. Per-file failures do not
/// make the command fail; a ledger failure does.
pub async fn handle_sync(args: SyncArgs, config: &AppConfig, quiet: bool) -> Result<()> {
    let start_time = Instant::now();
    args.validate().map_err(AppError::generic)?;

    let settings = config.sync_settings();
    let mode = args
        .mode
        .mode()
        .unwrap_or_else(|| LoadMode::from_incremental_flag(settings.incremental_load));
    let sample_cap = args.sample.or(settings.sample_file_count);

    let components = Components::build(config)?;
    let coordinator = components.coordinator(config, args.workers).await?;

    let request = if !args.files.is_empty() {
        RunRequest::for_files(&args.files, mode)
    } else if args.discovers_years() {
        let since = changed_since(args.changed_since)?;
        let years = coordinator.discover_years(since).await?;
        RunRequest::new(years.iter().map(|y| y.year).collect(), mode)
    } else {
        RunRequest::new(args.explicit_years(), mode)
    };
    let request = request.with_sample_cap(sample_cap);

    if request.years.is_empty() {
        println!("No years selected. Use --year, --from/--to, --all-years or --file.");
        return Ok(());
    }

    let cancel = coordinator.cancel_handle();
    let signal_task = SignalHandler::new(cancel.clone()).setup();

    if args.with_resources {
        let outcomes = coordinator
            .fetch_resources(&config.reference_resources()?, &config.resources.output_dir)
            .await;
        print_resource_outcomes(&outcomes);
    }

    println!(
        "🚀 Starting {} sync of {} year(s) with {} workers...",
        mode,
        request.years.len(),
        coordinator.config().worker_count
    );

    let (events_tx, events_rx) = mpsc::channel(coordinator.config().progress_buffer_size);
    let display = ProgressDisplay::new(ProgressConfig::for_terminal(quiet)).spawn(events_rx)?;
    let coordinator = coordinator.with_progress(events_tx);

    let resolver = LayoutResolver::from_storage(&config.storage);
    let result = coordinator.run(&request, &resolver).await;

    // Closing the last sender ends the display task
    drop(coordinator);
    let _ = display.await;
    signal_task.abort();

    let report = result?;
    print_report(&report);
    info!("Sync command finished in {:?}", start_time.elapsed());
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("\n📊 Sync Summary ({})", report.mode);
    for year in &report.years {
        println!("  {}", year);
    }

    let failures: Vec<_> = report.failures().collect();
    if !failures.is_empty() {
        println!("\nFailed files:");
        for (year, failure) in failures {
            println!(
                "  • {} [{}] {} after {} attempt(s): {}",
                year, failure.kind, failure.file_id, failure.attempts, failure.message
            );
        }
    }

    println!();
    println!("  {}", report.summary());
    println!("  Duration: {:?}", report.duration());
    if report.cancelled {
        println!("\n🛑 Run cancelled; unfinished files will be picked up by the next run.");
    }
}

/// Handle the plan command
pub async fn handle_plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    let settings = config.sync_settings();
    let mode = args
        .mode
        .mode()
        .unwrap_or_else(|| LoadMode::from_incremental_flag(settings.incremental_load));
    let sample_cap = args.sample.or(settings.sample_file_count);

    let components = Components::build(config)?;
    let coordinator = components.coordinator(config, None).await?;
    let plan = coordinator
        .plan_year(args.year, mode, sample_cap, &[])
        .await?;

    println!("📋 Plan for {} ({})", plan.year, plan.mode);
    println!("  To download: {}", plan.len());
    println!("  Skipped:     {}", plan.skipped_count);
    println!("  Deferred:    {}", plan.deferred_count);

    if !plan.is_empty() {
        println!();
        for (i, entry) in plan.to_download.iter().take(PLAN_PREVIEW_LIMIT).enumerate() {
            let size = entry
                .size_bytes
                .map(|s| format!("{} bytes", s))
                .unwrap_or_else(|| "size unknown".to_string());
            println!("  {}. {} ({})", i + 1, entry.file_name, size);
        }
        if plan.len() > PLAN_PREVIEW_LIMIT {
            println!("  ... and {} more files", plan.len() - PLAN_PREVIEW_LIMIT);
        }
    }
    Ok(())
}

/// Handle the years command
pub async fn handle_years(args: YearsArgs, config: &AppConfig) -> Result<()> {
    let components = Components::build(config)?;
    let since = changed_since(args.changed_since)?;
    let years = components.lister().list_years(since).await?;

    if years.is_empty() {
        println!("No year directories found.");
        return Ok(());
    }

    println!("📅 {} year directories", years.len());
    for entry in &years {
        match entry.last_modified {
            Some(at) => println!("  {}  {}", entry.year, at.format("%Y-%m-%d %H:%M")),
            None => println!("  {}", entry.year),
        }
    }
    Ok(())
}

/// Handle the resources command
pub async fn handle_resources(config: &AppConfig) -> Result<()> {
    let components = Components::build(config)?;
    let cancel = CancelHandle::new();
    let signal_task = SignalHandler::new(cancel.clone()).setup();

    let outcomes = resources::fetch_all(
        &components.fetcher(config),
        &StoreWriter::local(),
        &config.reference_resources()?,
        &config.resources.output_dir,
        &cancel.subscribe(),
    )
    .await;
    signal_task.abort();

    print_resource_outcomes(&outcomes);
    if outcomes.iter().all(ResourceOutcome::is_success) {
        Ok(())
    } else {
        Err(AppError::generic("One or more reference resources failed"))
    }
}

fn print_resource_outcomes(outcomes: &[ResourceOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(receipt) => println!(
                "✅ {} ({} bytes) -> {}",
                outcome.file_name, receipt.bytes_written, receipt.destination_ref
            ),
            Err(e) => {
                warn!("Reference resource {} failed: {}", outcome.file_name, e);
                println!("❌ {}: {}", outcome.file_name, e);
            }
        }
    }
}

/// Handle ledger inspection commands
pub async fn handle_ledger(args: LedgerArgs, config: &AppConfig) -> Result<()> {
    let ledger = IngestionLedger::open(&config.ledger.path).await?;

    match args.action {
        LedgerAction::Status => {
            let summary = ledger.summary().await;
            println!("📒 Ledger: {}", ledger.path().display());
            println!("  Records: {} across {} year(s)", summary.total, summary.years);
            for status in IngestionStatus::ALL {
                let count = summary.count(status);
                if count > 0 {
                    println!("  {:<18} {}", status.to_string(), count);
                }
            }
        }
        LedgerAction::Show { file_id } => match ledger.get(&file_id).await {
            Some(record) => {
                let json = serde_json::to_string_pretty(&record)
                    .map_err(|e| AppError::generic(format!("Failed to render record: {}", e)))?;
                println!("{}", json);
            }
            None => {
                return Err(AppError::generic(format!(
                    "No ledger record for {}",
                    file_id
                )))
            }
        },
    }
    Ok(())
}

/// Path `config init` writes to
pub fn config_init_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(AppConfig::default_config_path)
        .unwrap_or_else(|| PathBuf::from(config_files::LOCAL_CONFIG_FILE))
}

/// Handle configuration commands
///
/// `config init` does not need a loadable configuration, so `config` is only
/// consulted by `config show`.
pub async fn handle_config(
    args: ConfigArgs,
    config_path: Option<PathBuf>,
    config: Option<&AppConfig>,
) -> Result<()> {
    match args.action {
        ConfigAction::Init { force } => {
            let path = config_init_path(config_path);
            AppConfig::write_default_config(&path, force).await?;
            println!("✅ Wrote default configuration to {}", path.display());
        }
        ConfigAction::Show => {
            let config = match config {
                Some(config) => config.clone(),
                None => AppConfig::load(config_path).await?,
            };
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| AppError::generic(format!("Failed to render configuration: {}", e)))?;
            println!("{}", rendered);
        }
    }
    Ok(())
}
