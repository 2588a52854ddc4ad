//! Coordinator configuration

use serde::{Deserialize, Serialize};

use crate::constants::workers;

/// Runtime settings of the sync coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrent downloads per year
    pub worker_count: usize,
    /// Capacity of the progress event channel
    pub progress_buffer_size: usize,
    /// Compact the ledger journal after the year loop
    pub compact_after_run: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_count: workers::DEFAULT_WORKER_COUNT,
            progress_buffer_size: workers::PROGRESS_BUFFER_SIZE,
            compact_after_run: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.clamp(1, workers::MAX_WORKER_COUNT);
        self
    }
}
