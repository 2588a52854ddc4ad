//! Object store providers
//!
//! The engine only sees the [`ObjectStore`] capability trait. Each provider
//! declares how an all-or-nothing commit is achieved on it:
//!
//! - Azure Put Blob and GCS media uploads are atomic per key, so the payload
//!   goes straight to the final key.
//! - A directory-mounted bucket has no atomic put but can rename, so payloads
//!   go to a staging key and are promoted.
//! - Anything else puts the final key and deletes it if the put fails.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::constants::{cloud, env, files};
use crate::errors::{ConfigError, ConfigResult, StoreError, StoreResult};

/// How a provider makes a commit all-or-nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// A single put is atomic per key
    AtomicPut,
    /// Put to a staging key, then promote server-side
    StageAndPromote,
    /// Put the final key, delete it on failure
    PutThenCleanup,
}

/// Minimal object store contract
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Provider name for logs and errors
    fn name(&self) -> &str;

    /// Providers without atomic puts or a promote keep the default
    fn commit_mode(&self) -> CommitMode {
        CommitMode::PutThenCleanup
    }

    /// Create or replace `key` with `payload`
    async fn put(&self, container: &str, key: &str, payload: Bytes) -> StoreResult<()>;

    /// Remove `key`; a missing key is not an error
    async fn delete(&self, container: &str, key: &str) -> StoreResult<()>;

    /// Move `staging_key` onto `key`
    async fn promote(&self, container: &str, staging_key: &str, key: &str) -> StoreResult<()> {
        let _ = (container, staging_key, key);
        Err(StoreError::Unsupported {
            provider: self.name().to_string(),
            operation: "promote",
        })
    }
}

/// Commit `payload` to `container/key` using the store's commit mode
pub async fn commit_object(
    store: &dyn ObjectStore,
    container: &str,
    key: &str,
    payload: Bytes,
) -> StoreResult<()> {
    match store.commit_mode() {
        CommitMode::AtomicPut => store.put(container, key, payload).await,
        CommitMode::StageAndPromote => {
            let staging_key = staging_key(key);
            let result = match store.put(container, &staging_key, payload).await {
                Ok(()) => store.promote(container, &staging_key, key).await,
                Err(e) => Err(e),
            };
            if result.is_err() {
                cleanup(store, container, &staging_key).await;
            }
            result
        }
        CommitMode::PutThenCleanup => {
            let result = store.put(container, key, payload).await;
            if result.is_err() {
                cleanup(store, container, key).await;
            }
            result
        }
    }
}

async fn cleanup(store: &dyn ObjectStore, container: &str, key: &str) {
    if let Err(e) = store.delete(container, key).await {
        warn!(
            "{}: failed to clean up {}/{}: {}",
            store.name(),
            container,
            key,
            e
        );
    }
}

/// Unique staging key next to `key`
pub fn staging_key(key: &str) -> String {
    format!(
        "{}{}{:016x}",
        key,
        files::STAGING_KEY_INFIX,
        fastrand::u64(..)
    )
}

/// Object store providers selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProvider {
    Azure,
    Gcp,
    Filesystem,
}

impl CloudProvider {
    /// Resolve a configured provider name
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedProvider` for `aws` (recognised but
    /// not implemented) and for unknown names
    pub fn from_name(name: &str) -> ConfigResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "azure" => Ok(CloudProvider::Azure),
            "gcp" | "gcs" | "google" => Ok(CloudProvider::Gcp),
            "filesystem" | "fs" => Ok(CloudProvider::Filesystem),
            _ => Err(ConfigError::UnsupportedProvider {
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Azure => write!(f, "azure"),
            CloudProvider::Gcp => write!(f, "gcp"),
            CloudProvider::Filesystem => write!(f, "filesystem"),
        }
    }
}

fn required_env<F>(lookup: &F, key: &str) -> ConfigResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            field: key.to_string(),
        })
}

async fn check_response(
    provider: &str,
    key: &str,
    response: reqwest::Response,
    allow_not_found: bool,
) -> StoreResult<()> {
    let status = response.status();
    if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Provider {
        provider: provider.to_string(),
        key: key.to_string(),
        reason: format!("HTTP {}: {}", status.as_u16(), body.trim()),
    })
}

fn request_error(provider: &str, key: &str, error: reqwest::Error) -> StoreError {
    StoreError::Provider {
        provider: provider.to_string(),
        key: key.to_string(),
        reason: error.to_string(),
    }
}

/// Azure Blob Storage over the REST API with a SAS token
#[derive(Debug, Clone)]
pub struct AzureBlobStore {
    client: Client,
    account_url: Url,
    sas_token: String,
}

impl AzureBlobStore {
    pub fn new(client: Client, account_url: Url, sas_token: impl Into<String>) -> Self {
        let sas_token = sas_token.into();
        Self {
            client,
            account_url,
            sas_token: sas_token.trim_start_matches('?').to_string(),
        }
    }

    /// Build from `AZURE_STORAGE_ACCOUNT_URL` and `AZURE_STORAGE_SAS_TOKEN`
    pub fn from_env<F>(client: Client, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = required_env(&lookup, env::AZURE_ACCOUNT_URL)?;
        let account_url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidValue {
            field: env::AZURE_ACCOUNT_URL.to_string(),
            value: raw_url.clone(),
            reason: e.to_string(),
        })?;
        let sas_token = required_env(&lookup, env::AZURE_SAS_TOKEN)?;
        Ok(Self::new(client, account_url, sas_token))
    }

    fn blob_url(&self, container: &str, key: &str) -> StoreResult<Url> {
        let mut url = self.account_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Provider {
                provider: "azure".to_string(),
                key: key.to_string(),
                reason: format!("account URL {} cannot hold a path", self.account_url),
            })?
            .pop_if_empty()
            .push(container)
            .extend(key.split('/'));
        url.set_query(Some(&self.sas_token));
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn name(&self) -> &str {
        "azure"
    }

    fn commit_mode(&self) -> CommitMode {
        CommitMode::AtomicPut
    }

    async fn put(&self, container: &str, key: &str, payload: Bytes) -> StoreResult<()> {
        let url = self.blob_url(container, key)?;
        debug!("azure: PUT {}/{} ({} bytes)", container, key, payload.len());
        let response = self
            .client
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", cloud::AZURE_API_VERSION)
            .header("Content-Type", "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(|e| request_error(self.name(), key, e))?;
        check_response(self.name(), key, response, false).await
    }

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()> {
        let url = self.blob_url(container, key)?;
        let response = self
            .client
            .delete(url)
            .header("x-ms-version", cloud::AZURE_API_VERSION)
            .send()
            .await
            .map_err(|e| request_error(self.name(), key, e))?;
        check_response(self.name(), key, response, true).await
    }
}

/// Google Cloud Storage over the JSON API with an OAuth bearer token
#[derive(Debug, Clone)]
pub struct GcsStore {
    client: Client,
    access_token: String,
    upload_base: String,
    object_base: String,
}

impl GcsStore {
    pub fn new(client: Client, access_token: impl Into<String>) -> Self {
        Self {
            client,
            access_token: access_token.into(),
            upload_base: cloud::GCS_UPLOAD_BASE_URL.to_string(),
            object_base: cloud::GCS_OBJECT_BASE_URL.to_string(),
        }
    }

    /// Build from `GCS_ACCESS_TOKEN`
    pub fn from_env<F>(client: Client, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = required_env(&lookup, env::GCS_ACCESS_TOKEN)?;
        Ok(Self::new(client, token))
    }

    fn upload_url(&self, bucket: &str, key: &str) -> StoreResult<Url> {
        let mut url = self.parse(&format!("{}/{}/o", self.upload_base, bucket), key)?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, key: &str) -> StoreResult<Url> {
        let mut url = self.parse(&format!("{}/{}/o", self.object_base, bucket), key)?;
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(key);
        }
        Ok(url)
    }

    fn parse(&self, raw: &str, key: &str) -> StoreResult<Url> {
        Url::parse(raw).map_err(|e| StoreError::Provider {
            provider: "gcp".to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn name(&self) -> &str {
        "gcp"
    }

    fn commit_mode(&self) -> CommitMode {
        CommitMode::AtomicPut
    }

    async fn put(&self, bucket: &str, key: &str, payload: Bytes) -> StoreResult<()> {
        let url = self.upload_url(bucket, key)?;
        debug!("gcp: upload {}/{} ({} bytes)", bucket, key, payload.len());
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(|e| request_error(self.name(), key, e))?;
        check_response(self.name(), key, response, false).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let url = self.object_url(bucket, key)?;
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| request_error(self.name(), key, e))?;
        check_response(self.name(), key, response, true).await
    }
}

/// Bucket mounted as a directory: `<root>/<container>/<key>`
#[derive(Debug, Clone)]
pub struct FilesystemBucket {
    root: PathBuf,
}

impl FilesystemBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, container: &str, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.join(container), |path, part| path.join(part))
    }

    fn io_error(&self, key: &str, error: std::io::Error) -> StoreError {
        StoreError::Provider {
            provider: "filesystem".to_string(),
            key: key.to_string(),
            reason: error.to_string(),
        }
    }

    async fn ensure_parent(&self, path: &Path, key: &str) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FilesystemBucket {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn commit_mode(&self) -> CommitMode {
        CommitMode::StageAndPromote
    }

    async fn put(&self, container: &str, key: &str, payload: Bytes) -> StoreResult<()> {
        let path = self.object_path(container, key);
        self.ensure_parent(&path, key).await?;
        tokio::fs::write(&path, &payload)
            .await
            .map_err(|e| self.io_error(key, e))
    }

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()> {
        match tokio::fs::remove_file(self.object_path(container, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(key, e)),
        }
    }

    async fn promote(&self, container: &str, staging_key: &str, key: &str) -> StoreResult<()> {
        let from = self.object_path(container, staging_key);
        let to = self.object_path(container, key);
        self.ensure_parent(&to, key).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| self.io_error(key, e))
    }
}
