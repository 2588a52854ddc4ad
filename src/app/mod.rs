//! Core application logic for GSOD Sync
//!
//! This module contains the sync engine: directory listing, planning,
//! fetching, destination stores, the ingestion ledger and run orchestration.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gsod_sync::app::{build_transport, ClientConfig, DirectoryLister};
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = build_transport(&ClientConfig::default())?;
//! let lister = DirectoryLister::new(
//!     transport,
//!     Url::parse("https://www1.ncdc.noaa.gov/pub/data/gsod/")?,
//! );
//!
//! let listing = lister.list(2023).await?;
//! for entry in listing.entries.iter().take(5) {
//!     println!("{} {:?}", entry.file_name, entry.size_bytes);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod coordinator;
pub mod ledger;
pub mod models;
pub mod planner;
pub mod resources;
pub mod store;
pub mod worker;

// Re-export main public API
pub use client::{
    build_transport, ArchiveFetcher, ArchiveTransport, ClientConfig, DirectoryLister,
    HttpHandler, RetryPolicy,
};
pub use coordinator::{
    CancelHandle, CoordinatorConfig, FailureKind, FileFailure, ProgressTally, RunReport,
    RunRequest, SignalHandler, SyncCoordinator, SyncEvent, YearReport,
};
pub use ledger::{IngestionLedger, LedgerSnapshot, LedgerSummary};
pub use models::{
    ArchiveName, CommitReceipt, Destination, DownloadOutcome, IngestionRecord, IngestionStatus,
    LoadMode, RemoteEntry, RemoteListing, SyncPlan, YearEntry,
};
pub use planner::plan;
pub use resources::{ReferenceResource, ResourceOutcome};
pub use store::{
    build_store_writer, CloudProvider, DestinationResolver, LayoutResolver, ObjectStore,
    StoreWriter,
};
pub use worker::{FileOutcome, FileResult, FileTask, WorkerPool};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        // Ensure public API is accessible
        let config = ClientConfig::default();
        assert!(config.tcp_nodelay);
        assert_eq!(CoordinatorConfig::default().worker_count, 8);
    }
}
