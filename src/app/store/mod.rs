//! Destination store writer
//!
//! [`StoreWriter::write`] commits a decompressed payload to a [`Destination`]
//! all-or-nothing and returns a [`CommitReceipt`]. Local destinations go
//! through a staged temporary and a rename; cloud destinations go through the
//! configured [`ObjectStore`]. Rewriting identical bytes is a harmless replace.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info};

use crate::app::models::{decompressed_name, CommitReceipt, Destination};
use crate::config::StorageConfigToml;
use crate::errors::{ConfigError, Result, StoreError, StoreResult};

pub mod cloud;
pub mod local;

pub use cloud::{
    commit_object, AzureBlobStore, CloudProvider, CommitMode, FilesystemBucket, GcsStore,
    ObjectStore,
};
pub use local::{write_atomic, StagedFile};

/// Maps a listed archive onto its destination
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, year: i32, file_name: &str) -> Destination;
}

/// `<root>/<year>/<name>` locally or `<prefix>/<year>/<name>` in a container,
/// with the `.gz` suffix dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutResolver {
    Local { root: PathBuf },
    Cloud { container: String, prefix: String },
}

impl LayoutResolver {
    /// Layout selected by the storage settings
    pub fn from_storage(storage: &StorageConfigToml) -> Self {
        if storage.save_to_cloud {
            LayoutResolver::Cloud {
                container: storage.container.clone(),
                prefix: storage.blob_prefix.trim_matches('/').to_string(),
            }
        } else {
            LayoutResolver::Local {
                root: storage.raw_output_path.clone(),
            }
        }
    }
}

impl DestinationResolver for LayoutResolver {
    fn resolve(&self, year: i32, file_name: &str) -> Destination {
        let name = decompressed_name(file_name);
        match self {
            LayoutResolver::Local { root } => {
                Destination::local(root.clone(), PathBuf::from(year.to_string()).join(name))
            }
            LayoutResolver::Cloud { container, prefix } => {
                let key = if prefix.is_empty() {
                    format!("{}/{}", year, name)
                } else {
                    format!("{}/{}/{}", prefix, year, name)
                };
                Destination::cloud(container.clone(), key)
            }
        }
    }
}

/// Commits payloads to local paths or the configured object store
#[derive(Clone, Default)]
pub struct StoreWriter {
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl StoreWriter {
    /// Writer for local destinations only
    pub fn local() -> Self {
        Self::default()
    }

    /// Writer that also serves cloud destinations through `store`
    pub fn with_object_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_store: Some(store),
        }
    }

    /// Commit `payload` at `destination`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::WriteFailed`; the final location is then absent
    /// or holds its previous content
    pub async fn write(&self, payload: &[u8], destination: &Destination) -> StoreResult<CommitReceipt> {
        let destination_ref = destination.locator();

        match destination {
            Destination::LocalPath { root, subpath } => {
                let path = root.join(subpath);
                write_atomic(&path, payload)
                    .await
                    .map_err(|e| write_failed(&destination_ref, e.to_string()))?;
            }
            Destination::CloudObject { container, key } => {
                let store = self
                    .object_store
                    .as_ref()
                    .ok_or_else(|| write_failed(&destination_ref, "no object store configured"))?;
                commit_object(
                    store.as_ref(),
                    container,
                    key,
                    Bytes::copy_from_slice(payload),
                )
                .await
                .map_err(|e| write_failed(&destination_ref, e.to_string()))?;
            }
        }

        let receipt = CommitReceipt {
            destination_ref,
            bytes_written: payload.len() as u64,
            checksum: format!("{:x}", md5::compute(payload)),
            committed_at: Utc::now(),
        };
        debug!(
            "Committed {} bytes to {} (md5 {})",
            receipt.bytes_written, receipt.destination_ref, receipt.checksum
        );
        Ok(receipt)
    }
}

fn write_failed(destination: &str, cause: impl Into<String>) -> StoreError {
    StoreError::WriteFailed {
        destination: destination.to_string(),
        cause: cause.into(),
    }
}

/// Build the store writer selected by the storage settings
///
/// Cloud credentials are read from the environment.
pub fn build_store_writer(storage: &StorageConfigToml, client: Client) -> Result<StoreWriter> {
    if !storage.save_to_cloud {
        return Ok(StoreWriter::local());
    }

    let lookup = |key: &str| std::env::var(key).ok();
    let provider = CloudProvider::from_name(&storage.cloud_provider_name)?;
    let store: Arc<dyn ObjectStore> = match provider {
        CloudProvider::Azure => Arc::new(AzureBlobStore::from_env(client, lookup)?),
        CloudProvider::Gcp => Arc::new(GcsStore::from_env(client, lookup)?),
        CloudProvider::Filesystem => {
            let root = storage
                .bucket_root
                .clone()
                .ok_or_else(|| ConfigError::MissingField {
                    field: "storage.bucket_root".to_string(),
                })?;
            Arc::new(FilesystemBucket::new(root))
        }
    };

    info!(
        "Saving to {} container '{}'",
        provider, storage.container
    );
    Ok(StoreWriter::with_object_store(store))
}
