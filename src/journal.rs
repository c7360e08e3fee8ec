//! Append-only journals
//!
//! Mutations that must survive a crash are appended to a [`Journal`] before
//! the operation returns. [`FileJournal`] writes one JSON document per line
//! and syncs the file on every append; [`MemoryJournal`] keeps records in
//! memory and can be told to fail, which is how outage handling is tested.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Durable append-only record log
#[async_trait]
pub trait Journal<R>: Send + Sync
where
    R: Send + Sync,
{
    /// Append a record; returns only once the record is durable
    async fn append(&self, record: &R) -> EngineResult<()>;

    /// Read back every record in append order
    async fn replay(&self) -> EngineResult<Vec<R>>;
}

/// JSON-lines file journal
pub struct FileJournal<R> {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    _record: PhantomData<fn(R)>,
}

impl<R> FileJournal<R> {
    /// Open (creating if needed) the journal at `path`
    pub async fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!("Opened journal at {:?}", path);
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<R> Journal<R> for FileJournal<R>
where
    R: Serialize + DeserializeOwned + Send + Sync,
{
    async fn append(&self, record: &R) -> EngineResult<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| EngineError::invalid(format!("unserializable journal record: {}", e)))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn replay(&self) -> EngineResult<Vec<R>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn final line is what a crash mid-append leaves behind
                Err(e) => warn!(
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable journal line in {:?}",
                    self.path
                ),
            }
        }
        Ok(records)
    }
}

/// In-memory journal
pub struct MemoryJournal<R> {
    records: Mutex<Vec<R>>,
    failures_left: AtomicU32,
}

impl<R> MemoryJournal<R> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
        }
    }

    /// Make the next `n` appends fail with `Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> Default for MemoryJournal<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R> Journal<R> for MemoryJournal<R>
where
    R: Clone + Send + Sync,
{
    async fn append(&self, record: &R) -> EngineResult<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::Unavailable("journal unavailable".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn replay(&self) -> EngineResult<Vec<R>> {
        Ok(self.records.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: u32,
        note: String,
    }

    #[tokio::test]
    async fn test_file_journal_replays_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/journal.jsonl");

        let journal = FileJournal::<Entry>::open(&path).await.unwrap();
        for id in 0..3 {
            journal
                .append(&Entry {
                    id,
                    note: format!("n{}", id),
                })
                .await
                .unwrap();
        }

        let reopened = FileJournal::<Entry>::open(&path).await.unwrap();
        let records = reopened.replay().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].note, "n2");
    }

    #[tokio::test]
    async fn test_file_journal_skips_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, "{\"id\":1,\"note\":\"ok\"}\n{\"id\":2,\"no").unwrap();

        let journal = FileJournal::<Entry>::open(&path).await.unwrap();
        let records = journal.replay().await.unwrap();
        assert_eq!(records, vec![Entry { id: 1, note: "ok".into() }]);
    }

    #[tokio::test]
    async fn test_memory_journal_failure_injection() {
        let journal = MemoryJournal::<Entry>::new();
        journal.fail_next(2);

        let entry = Entry {
            id: 1,
            note: "x".into(),
        };
        assert!(journal.append(&entry).await.is_err());
        assert!(journal.append(&entry).await.is_err());
        assert!(journal.append(&entry).await.is_ok());
        assert_eq!(journal.len(), 1);
    }
}
