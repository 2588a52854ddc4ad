//! Reference resources downloaded alongside the archives
//!
//! The station history CSV and the country list are plain files. They go
//! through the same retrying fetcher as the archives and are written locally
//! with the atomic store, but they are not tracked in the ledger: every
//! request downloads them again.

use std::path::Path;

use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::app::client::ArchiveFetcher;
use crate::app::models::{CommitReceipt, Destination};
use crate::app::store::StoreWriter;
use crate::errors::{AppError, Result};

/// An auxiliary file and the local name it is saved under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceResource {
    pub url: Url,
    pub file_name: String,
}

impl ReferenceResource {
    pub fn new(url: Url, file_name: impl Into<String>) -> Self {
        Self {
            url,
            file_name: file_name.into(),
        }
    }
}

/// Result of fetching one reference resource
#[derive(Debug)]
pub struct ResourceOutcome {
    pub file_name: String,
    pub attempts: u32,
    pub result: Result<CommitReceipt>,
}

impl ResourceOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fetch `resources` in order and write them under `output_dir`
///
/// Failures are reported per resource. Resources not started before
/// cancellation are omitted.
pub async fn fetch_all(
    fetcher: &ArchiveFetcher,
    store: &StoreWriter,
    resources: &[ReferenceResource],
    output_dir: &Path,
    cancel: &watch::Receiver<bool>,
) -> Vec<ResourceOutcome> {
    let mut outcomes = Vec::with_capacity(resources.len());

    for resource in resources {
        if *cancel.borrow() {
            break;
        }

        let outcome = fetcher
            .fetch_resource(&resource.file_name, &resource.url, cancel)
            .await;
        let attempts = outcome.attempts;

        let result = match outcome.result {
            Ok(fetched) => {
                let destination = Destination::local(output_dir, &resource.file_name);
                store
                    .write(&fetched.payload, &destination)
                    .await
                    .map_err(AppError::from)
            }
            Err(e) => Err(AppError::from(e)),
        };

        match &result {
            Ok(receipt) => info!(
                "Fetched {} ({} bytes) to {}",
                resource.file_name, receipt.bytes_written, receipt.destination_ref
            ),
            Err(e) => warn!("Reference resource {} failed: {}", resource.file_name, e),
        }

        outcomes.push(ResourceOutcome {
            file_name: resource.file_name.clone(),
            attempts,
            result,
        });
    }

    outcomes
}
