//! Bounded worker pool for one year's plan
//!
//! The pool spawns `min(worker_count, planned)` tokio tasks that drain a
//! shared queue of [`FileTask`]s. Workers stop taking new files once the run
//! is cancelled or another worker hit a ledger failure.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{FileResult, FileTask, WorkerContext};
use crate::app::client::ArchiveFetcher;
use crate::app::coordinator::progress::SyncEvent;
use crate::app::coordinator::report::FailureKind;
use crate::app::ledger::IngestionLedger;
use crate::app::store::StoreWriter;
use crate::errors::{LedgerError, LedgerResult};

/// Pool of download workers sharing a fetcher, a store and the ledger
#[derive(Clone)]
pub struct WorkerPool {
    context: WorkerContext,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(
        fetcher: ArchiveFetcher,
        store: StoreWriter,
        ledger: Arc<IngestionLedger>,
        worker_count: usize,
    ) -> Self {
        Self {
            context: WorkerContext {
                fetcher,
                store,
                ledger,
                events: None,
            },
            worker_count: worker_count.max(1),
        }
    }

    /// Send per-file progress events to `events`
    pub fn with_events(mut self, events: mpsc::Sender<SyncEvent>) -> Self {
        self.context.events = Some(events);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Process `tasks` concurrently and return one result per started file
    ///
    /// Files never started because of cancellation have no result.
    ///
    /// # Errors
    ///
    /// Returns the first ledger error any worker hit
    pub async fn run(
        &self,
        tasks: Vec<FileTask>,
        cancel: watch::Receiver<bool>,
    ) -> LedgerResult<Vec<FileResult>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.worker_count.min(tasks.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let abort = Arc::new(AtomicBool::new(false));
        info!("Starting {} workers", workers);

        let handles: Vec<JoinHandle<WorkerRun>> = (0..workers)
            .map(|worker_id| {
                let context = self.context.clone();
                let queue = queue.clone();
                let abort = abort.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, context, queue, abort, cancel).await
                })
            })
            .collect();

        let mut results = Vec::new();
        let mut first_error: Option<LedgerError> = None;
        for handle in handles {
            match handle.await {
                Ok(run) => {
                    results.extend(run.results);
                    if let Some(e) = run.error {
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

struct WorkerRun {
    results: Vec<FileResult>,
    error: Option<LedgerError>,
}

async fn worker_loop(
    worker_id: usize,
    context: WorkerContext,
    queue: Arc<Mutex<VecDeque<FileTask>>>,
    abort: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
) -> WorkerRun {
    let mut run = WorkerRun {
        results: Vec::new(),
        error: None,
    };

    loop {
        if abort.load(Ordering::SeqCst) || *cancel.borrow() {
            break;
        }
        let Some(task) = queue.lock().await.pop_front() else {
            break;
        };

        match AssertUnwindSafe(context.process(&task, &cancel))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => run.results.push(result),
            Ok(Err(e)) => {
                error!("Worker {}: ledger failure on {}: {}", worker_id, task.entry.file_name, e);
                abort.store(true, Ordering::SeqCst);
                run.error = Some(e);
                break;
            }
            Err(panic) => {
                let message = format!("worker panicked: {}", panic_message(panic.as_ref()));
                error!("Worker {}: {} on {}", worker_id, message, task.entry.file_name);
                let result = context
                    .failed(&task, 0, FailureKind::Internal, message)
                    .await;
                run.results.push(result);
            }
        }
    }

    debug!(
        "Worker {} finished after {} files",
        worker_id,
        run.results.len()
    );
    run
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown cause"
    }
}
