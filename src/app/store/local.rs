//! Atomic local file commits
//!
//! Payloads are written to a uniquely named hidden sibling of the final path,
//! flushed and fsynced, then renamed over the final path. A staged file that
//! is dropped without being committed deletes its temporary.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::constants::files;

/// Unique temporary sibling of `path`: `.<name>.<random>.tmp`
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{:016x}{}",
        name,
        fastrand::u64(..),
        files::TEMP_FILE_SUFFIX
    ))
}

/// A payload written to a temporary sibling, waiting to be committed
#[derive(Debug)]
pub struct StagedFile {
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl StagedFile {
    /// Write `payload` next to `final_path` and make it durable
    pub async fn stage(final_path: &Path, payload: &[u8]) -> std::io::Result<Self> {
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let staged = Self {
            temp_path: temp_sibling(final_path),
            final_path: final_path.to_path_buf(),
            committed: false,
        };

        let mut file = tokio::fs::File::create(&staged.temp_path).await?;
        file.write_all(payload).await?;
        file.flush().await?;
        file.sync_all().await?;
        debug!(
            "Staged {} bytes at {}",
            payload.len(),
            staged.temp_path.display()
        );
        Ok(staged)
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Rename the temporary onto the final path
    pub async fn commit(mut self) -> std::io::Result<()> {
        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => debug!("Discarded staged file {}", self.temp_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove staged file {}: {}",
                self.temp_path.display(),
                e
            ),
        }
    }
}

/// Atomically replace `final_path` with `payload`
pub async fn write_atomic(final_path: &Path, payload: &[u8]) -> std::io::Result<()> {
    StagedFile::stage(final_path, payload).await?.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[test]
    fn test_temp_sibling_is_hidden_and_unique() {
        let path = Path::new("/data/raw/2023/010010-99999-2023.op");
        let first = temp_sibling(path);
        let second = temp_sibling(path);

        assert_eq!(first.parent(), path.parent());
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".010010-99999-2023.op."));
        assert!(name.ends_with(files::TEMP_FILE_SUFFIX));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("2023").join("010010-99999-2023.op");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");
        assert_eq!(
            dir_entries(path.parent().unwrap()).await,
            vec!["010010-99999-2023.op"]
        );
    }

    #[tokio::test]
    async fn test_interrupted_write_leaves_final_path_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("010010-99999-2023.op");
        write_atomic(&path, b"committed").await.unwrap();

        let staged = StagedFile::stage(&path, b"half-written").await.unwrap();
        assert!(staged.temp_path().exists());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"committed");

        // Interrupted before rename
        let temp_path = staged.temp_path().to_path_buf();
        drop(staged);

        assert!(!temp_path.exists());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"committed");
    }

    #[tokio::test]
    async fn test_interrupted_first_write_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("010010-99999-2023.op");

        let staged = StagedFile::stage(&path, b"partial").await.unwrap();
        drop(staged);

        assert!(!path.exists());
        assert!(dir_entries(temp_dir.path()).await.is_empty());
    }
}
