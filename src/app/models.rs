//! Data models for GSOD Sync
//!
//! This module defines the core data structures passed between the lister,
//! planner, fetcher, store writer and ledger, together with the archive file
//! name rules of the GSOD tree.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::gsod;
use crate::errors::{FetchError, LedgerError, LedgerResult};

fn archive_name_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(gsod::ARCHIVE_NAME_PATTERN).expect("archive pattern is valid"))
}

/// Components of a GSOD archive name such as `010010-99999-2023.op.gz`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    /// USAF station identifier
    pub station: String,
    /// WBAN identifier
    pub wban: String,
    /// Observation year
    pub year: i32,
}

impl ArchiveName {
    /// Parse an archive file name, returning `None` for anything else
    pub fn parse(file_name: &str) -> Option<Self> {
        let captures = archive_name_regex().captures(file_name)?;
        Some(Self {
            station: captures[1].to_string(),
            wban: captures[2].to_string(),
            year: captures[3].parse().ok()?,
        })
    }

    /// Whether `file_name` matches the archive pattern
    pub fn matches(file_name: &str) -> bool {
        archive_name_regex().is_match(file_name)
    }
}

/// Name of the decompressed payload for an archive (`.op.gz` -> `.op`)
pub fn decompressed_name(file_name: &str) -> &str {
    file_name
        .strip_suffix(gsod::ARCHIVE_EXTENSION)
        .unwrap_or(file_name)
}

/// One remote file reference from a year listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Archive file name; identity of the entry
    pub file_name: String,
    /// Advertised size, when the listing shows one
    pub size_bytes: Option<u64>,
    /// Advertised modification time, when the listing shows one
    pub last_modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    /// Entry without listing metadata
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            size_bytes: None,
            last_modified: None,
        }
    }

    /// Set the advertised size
    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    /// Set the advertised modification time
    pub fn with_last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }

    /// Ledger identifier of this entry
    pub fn file_id(&self) -> &str {
        &self.file_name
    }
}

/// One year's directory page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteListing {
    pub year: i32,
    /// Entries in listing order
    pub entries: Vec<RemoteEntry>,
}

impl RemoteListing {
    pub fn new(year: i32, entries: Vec<RemoteEntry>) -> Self {
        Self { year, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One year directory from the root index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearEntry {
    pub year: i32,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Load policy for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadMode {
    /// Everything not yet committed
    Historical,
    /// Only new, changed or previously failed files
    Incremental,
}

impl LoadMode {
    /// Mode selected by the `incremental_load` flag
    pub fn from_incremental_flag(incremental: bool) -> Self {
        if incremental {
            Self::Incremental
        } else {
            Self::Historical
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Historical => write!(f, "historical"),
            LoadMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Lifecycle of a file in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IngestionStatus {
    Pending,
    Downloaded,
    DownloadFailed,
    DecompressFailed,
    WriteFailed,
    Committed,
}

impl IngestionStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [IngestionStatus; 6] = [
        IngestionStatus::Pending,
        IngestionStatus::Downloaded,
        IngestionStatus::DownloadFailed,
        IngestionStatus::DecompressFailed,
        IngestionStatus::WriteFailed,
        IngestionStatus::Committed,
    ];

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            IngestionStatus::DownloadFailed
                | IngestionStatus::DecompressFailed
                | IngestionStatus::WriteFailed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    ///
    /// Pending -> Downloaded | DownloadFailed | DecompressFailed
    /// Downloaded -> WriteFailed | Committed
    /// failed, committed or interrupted -> Pending (re-selected by a later run)
    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        match (self, next) {
            (Pending, Pending) => true,
            (Pending, Downloaded | DownloadFailed | DecompressFailed) => true,
            (Downloaded, WriteFailed | Committed) => true,
            (DownloadFailed | DecompressFailed | WriteFailed, Pending) => true,
            (Downloaded | Committed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Downloaded => "downloaded",
            IngestionStatus::DownloadFailed => "download-failed",
            IngestionStatus::DecompressFailed => "decompress-failed",
            IngestionStatus::WriteFailed => "write-failed",
            IngestionStatus::Committed => "committed",
        };
        f.write_str(name)
    }
}

impl FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngestionStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("unknown ingestion status: {}", s))
    }
}

/// One persisted ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub file_id: String,
    pub year: i32,
    pub last_seen_size: Option<u64>,
    pub last_seen_modified: Option<DateTime<Utc>>,
    pub status: IngestionStatus,
    /// Present only when committed
    pub committed_at: Option<DateTime<Utc>>,
    pub destination_ref: Option<String>,
    /// MD5 of the committed payload
    #[serde(default)]
    pub checksum: Option<String>,
    /// HTTP attempts used by the last fetch
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionRecord {
    /// Fresh `Pending` record carrying the entry's listing metadata
    pub fn pending(year: i32, entry: &RemoteEntry) -> Self {
        Self {
            file_id: entry.file_name.clone(),
            year,
            last_seen_size: entry.size_bytes,
            last_seen_modified: entry.last_modified,
            status: IngestionStatus::Pending,
            committed_at: None,
            destination_ref: None,
            checksum: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Keep `previous` listing metadata wherever this record has none
    pub fn with_prior_metadata(mut self, previous: &IngestionRecord) -> Self {
        self.last_seen_size = self.last_seen_size.or(previous.last_seen_size);
        self.last_seen_modified = self.last_seen_modified.or(previous.last_seen_modified);
        self
    }

    /// Copy of this record moved to `status`
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransition` if the lifecycle forbids it
    pub fn transition(&self, status: IngestionStatus) -> LedgerResult<Self> {
        if !self.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                file_id: self.file_id.clone(),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        let mut next = self.clone();
        next.status = status;
        if status != IngestionStatus::Committed {
            next.committed_at = None;
        }
        next.updated_at = Utc::now();
        Ok(next)
    }

    pub fn is_committed(&self) -> bool {
        self.status == IngestionStatus::Committed
    }

    /// Whether the listing entry differs from what was last seen
    ///
    /// Only values present on both sides are compared, so a listing without
    /// metadata never reports a change.
    pub fn metadata_changed(&self, entry: &RemoteEntry) -> bool {
        let size_changed = matches!(
            (self.last_seen_size, entry.size_bytes),
            (Some(seen), Some(now)) if seen != now
        );
        let modified_changed = matches!(
            (self.last_seen_modified, entry.last_modified),
            (Some(seen), Some(now)) if seen != now
        );
        size_changed || modified_changed
    }
}

/// One run's download decision for a year
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub year: i32,
    pub mode: LoadMode,
    /// Entries to fetch, listing order, no duplicates
    pub to_download: Vec<RemoteEntry>,
    /// Entries not selected by the load policy
    pub skipped_count: usize,
    /// Entries selected by policy but cut by the sample cap
    pub deferred_count: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_download.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_download.len()
    }

    /// File identifiers in plan order
    pub fn file_ids(&self) -> Vec<&str> {
        self.to_download.iter().map(|e| e.file_id()).collect()
    }
}

/// Bytes of a completed transfer
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    /// Body as received
    pub raw_bytes: Bytes,
    /// Decompressed payload (equal to the raw bytes for uncompressed resources)
    pub payload: Vec<u8>,
}

/// Result of one fetch
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_id: String,
    /// HTTP attempts made
    pub attempts: u32,
    pub result: Result<FetchedArchive, FetchError>,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Decompressed payload, on success
    pub fn decompressed_payload(&self) -> Option<&[u8]> {
        self.result.as_ref().ok().map(|a| a.payload.as_slice())
    }
}

/// Where a payload is committed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// File at `root/subpath`
    LocalPath { root: PathBuf, subpath: PathBuf },
    /// Object `key` in `container`
    CloudObject { container: String, key: String },
}

impl Destination {
    pub fn local(root: impl Into<PathBuf>, subpath: impl Into<PathBuf>) -> Self {
        Self::LocalPath {
            root: root.into(),
            subpath: subpath.into(),
        }
    }

    pub fn cloud(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self::CloudObject {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Store-specific locator recorded in the ledger
    pub fn locator(&self) -> String {
        match self {
            Destination::LocalPath { root, subpath } => root.join(subpath).display().to_string(),
            Destination::CloudObject { container, key } => format!("{}/{}", container, key),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.locator())
    }
}

/// Proof of a committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub destination_ref: String,
    pub bytes_written: u64,
    /// MD5 hex digest of the payload
    pub checksum: String,
    pub committed_at: DateTime<Utc>,
}
