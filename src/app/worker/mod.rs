//! Per-file download workers
//!
//! A worker takes one planned file through fetch, decompression, store
//! commit and the matching ledger transitions:
//!
//! ```text
//! Pending -> Downloaded -> Committed
//!         \-> DownloadFailed | DecompressFailed
//!                       Downloaded -> WriteFailed
//! ```
//!
//! Fetch and store failures stay with the file. Only a ledger failure stops
//! the pool, since nothing it does afterwards could be recorded.

pub mod pool;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::app::client::ArchiveFetcher;
use crate::app::coordinator::progress::SyncEvent;
use crate::app::coordinator::report::{FailureKind, FileFailure};
use crate::app::ledger::IngestionLedger;
use crate::app::models::{CommitReceipt, Destination, IngestionRecord, IngestionStatus, RemoteEntry};
use crate::app::store::StoreWriter;
use crate::errors::{FetchError, LedgerResult};

pub use pool::WorkerPool;

/// One planned file and where it goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTask {
    pub year: i32,
    pub entry: RemoteEntry,
    pub destination: Destination,
}

/// How a file's processing ended
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Committed(CommitReceipt),
    Failed(FileFailure),
    /// Abandoned at a cancellation checkpoint; nothing was written
    Cancelled,
}

/// Result of one worker step
#[derive(Debug, Clone, PartialEq)]
pub struct FileResult {
    pub file_id: String,
    pub attempts: u32,
    pub outcome: FileOutcome,
}

impl FileResult {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, FileOutcome::Committed(_))
    }
}

/// Components a worker step needs
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub fetcher: ArchiveFetcher,
    pub store: StoreWriter,
    pub ledger: Arc<IngestionLedger>,
    pub events: Option<mpsc::Sender<SyncEvent>>,
}

impl WorkerContext {
    async fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    /// Take one file from Pending to its final status
    ///
    /// # Errors
    ///
    /// Returns the ledger error if any ledger update fails
    pub(crate) async fn process(
        &self,
        task: &FileTask,
        cancel: &watch::Receiver<bool>,
    ) -> LedgerResult<FileResult> {
        let file_id = task.entry.file_id().to_string();
        let mut pending = IngestionRecord::pending(task.year, &task.entry);
        if let Some(previous) = self.ledger.get(&file_id).await {
            pending = pending.with_prior_metadata(&previous);
        }
        self.ledger.upsert(pending.clone()).await?;

        let outcome = self.fetcher.fetch(task.year, &task.entry, cancel).await;
        let attempts = outcome.attempts;

        let archive = match outcome.result {
            Ok(archive) => archive,
            Err(FetchError::Cancelled { .. }) => {
                debug!("{}: cancelled before download completed", file_id);
                return Ok(FileResult {
                    file_id,
                    attempts,
                    outcome: FileOutcome::Cancelled,
                });
            }
            Err(error) => {
                let (status, kind) = match error {
                    FetchError::DecompressFailed { .. } => {
                        (IngestionStatus::DecompressFailed, FailureKind::Decompress)
                    }
                    _ => (IngestionStatus::DownloadFailed, FailureKind::Download),
                };
                warn!("{}: {}", file_id, error);
                let mut failed = pending.transition(status)?;
                failed.attempts = attempts;
                failed.last_error = Some(error.to_string());
                self.ledger.upsert(failed).await?;

                return Ok(self
                    .failed(task, attempts, kind, error.to_string())
                    .await);
            }
        };

        let mut downloaded = pending.transition(IngestionStatus::Downloaded)?;
        downloaded.attempts = attempts;
        self.ledger.upsert(downloaded.clone()).await?;

        // Last safe checkpoint before the destination is touched
        if *cancel.borrow() {
            debug!("{}: cancelled before write", file_id);
            return Ok(FileResult {
                file_id,
                attempts,
                outcome: FileOutcome::Cancelled,
            });
        }

        match self.store.write(&archive.payload, &task.destination).await {
            Ok(receipt) => {
                self.ledger.record_commit(&file_id, &receipt).await?;
                info!(
                    "Committed {} ({} bytes) to {}",
                    file_id, receipt.bytes_written, receipt.destination_ref
                );
                self.emit(SyncEvent::FileCommitted {
                    year: task.year,
                    file_id: file_id.clone(),
                    bytes: receipt.bytes_written,
                })
                .await;
                Ok(FileResult {
                    file_id,
                    attempts,
                    outcome: FileOutcome::Committed(receipt),
                })
            }
            Err(error) => {
                warn!("{}: {}", file_id, error);
                let mut failed = downloaded.transition(IngestionStatus::WriteFailed)?;
                failed.last_error = Some(error.to_string());
                self.ledger.upsert(failed).await?;

                Ok(self
                    .failed(task, attempts, FailureKind::Write, error.to_string())
                    .await)
            }
        }
    }

    async fn failed(
        &self,
        task: &FileTask,
        attempts: u32,
        kind: FailureKind,
        message: String,
    ) -> FileResult {
        let failure = FileFailure {
            file_id: task.entry.file_id().to_string(),
            kind,
            message,
            attempts,
        };
        self.emit(SyncEvent::FileFailed {
            year: task.year,
            failure: failure.clone(),
        })
        .await;
        FileResult {
            file_id: failure.file_id.clone(),
            attempts,
            outcome: FileOutcome::Failed(failure),
        }
    }
}
