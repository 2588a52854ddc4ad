//! Durable ingestion ledger
//!
//! The ledger is an append-only JSON-lines journal holding one full
//! [`IngestionRecord`] per line; the last line for a file wins. It is loaded
//! into memory at open and every update is appended and fsynced before the
//! in-memory copy changes.
//!
//! A torn final line (crash during an append) is dropped with a warning and
//! the journal is rewritten. An unreadable line anywhere else makes the ledger
//! unavailable. [`IngestionLedger::compact`] rewrites the journal as one line
//! per record through a temporary file and a rename.
//!
//! Updates to the same file are serialized by a per-file lock; updates to
//! different files only share the short journal append.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::app::models::{CommitReceipt, IngestionRecord, IngestionStatus};
use crate::app::store::local::temp_sibling;
use crate::constants::ledger as ledger_constants;
use crate::errors::{LedgerError, LedgerResult};

/// Read-only copy of the ledger used for planning
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    records: HashMap<String, IngestionRecord>,
}

impl LedgerSnapshot {
    pub fn from_records(records: Vec<IngestionRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.file_id.clone(), record))
                .collect(),
        }
    }

    pub fn get(&self, file_id: &str) -> Option<&IngestionRecord> {
        self.records.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &IngestionRecord> {
        self.records.values()
    }
}

/// Record counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub by_status: BTreeMap<IngestionStatus, usize>,
    pub years: usize,
}

impl LedgerSummary {
    pub fn count(&self, status: IngestionStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

struct Journal {
    file: File,
    lines: usize,
}

/// Journal-backed record of what has been ingested
pub struct IngestionLedger {
    path: PathBuf,
    records: RwLock<HashMap<String, IngestionRecord>>,
    journal: Mutex<Journal>,
    file_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for IngestionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl IngestionLedger {
    /// Open (or create) the journal at `path` and load every record
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Unavailable` if the journal cannot be read or
    /// opened for appending, `LedgerError::Corrupted` if a line other than the
    /// last cannot be parsed
    pub async fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| unavailable(&path, e))?;
            }
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(unavailable(&path, e)),
        };
        let replay = replay_journal(&path, &content)?;

        let file = open_for_append(&path).await?;
        let ledger = Self {
            path: path.clone(),
            records: RwLock::new(replay.records),
            journal: Mutex::new(Journal {
                file,
                lines: replay.lines,
            }),
            file_locks: std::sync::Mutex::new(HashMap::new()),
        };

        let record_count = ledger.len().await;
        if replay.torn_tail
            || replay.unterminated
            || replay.lines > record_count.max(1) * ledger_constants::COMPACTION_RATIO
        {
            ledger.compact().await?;
        }

        info!(
            "Opened ledger {} ({} records)",
            path.display(),
            record_count
        );
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Current record for `file_id`
    pub async fn get(&self, file_id: &str) -> Option<IngestionRecord> {
        self.records.read().await.get(file_id).cloned()
    }

    /// Insert or replace the record for `record.file_id`
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidTransition` if the existing record's
    /// status cannot move to the new one, `LedgerError::Unavailable` if the
    /// journal append fails
    pub async fn upsert(&self, record: IngestionRecord) -> LedgerResult<()> {
        let lock = self.file_lock(&record.file_id);
        let _guard = lock.lock().await;

        if let Some(current) = self.get(&record.file_id).await {
            if !current.status.can_transition_to(record.status) {
                return Err(LedgerError::InvalidTransition {
                    file_id: record.file_id.clone(),
                    from: current.status.to_string(),
                    to: record.status.to_string(),
                });
            }
        }

        self.persist(record).await
    }

    /// Mark a downloaded file as committed at `destination_ref`
    pub async fn mark_committed(
        &self,
        file_id: &str,
        destination_ref: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<IngestionRecord> {
        self.commit(file_id, destination_ref, at, None).await
    }

    /// Mark a downloaded file as committed with the store's receipt
    pub async fn record_commit(
        &self,
        file_id: &str,
        receipt: &CommitReceipt,
    ) -> LedgerResult<IngestionRecord> {
        self.commit(
            file_id,
            &receipt.destination_ref,
            receipt.committed_at,
            Some(receipt.checksum.clone()),
        )
        .await
    }

    async fn commit(
        &self,
        file_id: &str,
        destination_ref: &str,
        at: DateTime<Utc>,
        checksum: Option<String>,
    ) -> LedgerResult<IngestionRecord> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let current = self
            .get(file_id)
            .await
            .ok_or_else(|| LedgerError::UnknownFile {
                file_id: file_id.to_string(),
            })?;

        let mut record = current.transition(IngestionStatus::Committed)?;
        record.committed_at = Some(at);
        record.destination_ref = Some(destination_ref.to_string());
        record.checksum = checksum;
        record.last_error = None;

        self.persist(record.clone()).await?;
        Ok(record)
    }

    /// Read-only copy of every record
    pub async fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            records: self.records.read().await.clone(),
        }
    }

    /// Record counts per status
    pub async fn summary(&self) -> LedgerSummary {
        let records = self.records.read().await;
        let mut summary = LedgerSummary {
            total: records.len(),
            ..LedgerSummary::default()
        };
        let mut years = std::collections::HashSet::new();
        for record in records.values() {
            *summary.by_status.entry(record.status).or_insert(0) += 1;
            years.insert(record.year);
        }
        summary.years = years.len();
        summary
    }

    /// Rewrite the journal as one line per record
    pub async fn compact(&self) -> LedgerResult<()> {
        let mut journal = self.journal.lock().await;
        let records = self.records.read().await;

        let mut ordered: Vec<&IngestionRecord> = records.values().collect();
        ordered.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        let mut content = String::new();
        for record in &ordered {
            content.push_str(&encode(&self.path, record)?);
        }

        let temp_path = temp_sibling(&self.path);
        let write_result = async {
            let mut file = File::create(&temp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp_path, &self.path).await
        }
        .await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(unavailable(&self.path, e));
        }

        let previous_lines = journal.lines;
        journal.file = open_for_append(&self.path).await?;
        journal.lines = ordered.len();
        debug!(
            "Compacted ledger {}: {} -> {} lines",
            self.path.display(),
            previous_lines,
            journal.lines
        );
        Ok(())
    }

    /// Append `record` to the journal, then publish it in memory
    async fn persist(&self, record: IngestionRecord) -> LedgerResult<()> {
        let line = encode(&self.path, &record)?;

        let mut journal = self.journal.lock().await;
        journal
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| unavailable(&self.path, e))?;
        // Surfaces the result of the buffered write
        journal
            .file
            .flush()
            .await
            .map_err(|e| unavailable(&self.path, e))?;
        journal
            .file
            .sync_data()
            .await
            .map_err(|e| unavailable(&self.path, e))?;
        journal.lines += 1;

        debug!("Ledger: {} -> {}", record.file_id, record.status);
        self.records
            .write()
            .await
            .insert(record.file_id.clone(), record);
        Ok(())
    }

    /// Swap the append handle for a read-only one so later appends fail
    #[cfg(test)]
    pub(crate) async fn reopen_read_only(&self) -> std::io::Result<()> {
        let mut journal = self.journal.lock().await;
        journal.file = File::open(&self.path).await?;
        Ok(())
    }

    fn file_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.file_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

struct Replay {
    records: HashMap<String, IngestionRecord>,
    lines: usize,
    torn_tail: bool,
    // Last line lacks its newline; appending would glue onto it
    unterminated: bool,
}

fn replay_journal(path: &Path, content: &str) -> LedgerResult<Replay> {
    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut records = HashMap::new();
    let mut torn_tail = false;
    for (position, (index, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<IngestionRecord>(line) {
            Ok(record) => {
                records.insert(record.file_id.clone(), record);
            }
            Err(e) if position + 1 == lines.len() => {
                warn!(
                    "Ignoring torn final line {} of ledger {}: {}",
                    index + 1,
                    path.display(),
                    e
                );
                torn_tail = true;
            }
            Err(e) => {
                return Err(LedgerError::Corrupted {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason: e.to_string(),
                })
            }
        }
    }

    Ok(Replay {
        records,
        lines: lines.len(),
        torn_tail,
        unterminated: !content.is_empty() && !content.ends_with('\n'),
    })
}

fn encode(path: &Path, record: &IngestionRecord) -> LedgerResult<String> {
    let mut line = serde_json::to_string(record).map_err(|e| LedgerError::Unavailable {
        path: path.to_path_buf(),
        reason: format!("cannot encode record {}: {}", record.file_id, e),
    })?;
    line.push('\n');
    Ok(line)
}

async fn open_for_append(path: &Path) -> LedgerResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| unavailable(path, e))
}

fn unavailable(path: &Path, error: std::io::Error) -> LedgerError {
    LedgerError::Unavailable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}
