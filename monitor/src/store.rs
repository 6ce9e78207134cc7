//! Durable pending-delivery store.
//!
//! Payloads that are not sent immediately are appended to a JSONL file and
//! stay there until the [`PayloadBatcher`](crate::batcher::PayloadBatcher)
//! receives an acknowledgement for them.
//!
//! # Design
//!
//! - **Durable append**: [`PayloadStore::append`] returns only after the new
//!   line has been written and synced to disk.
//!
//! - **Identity**: every stored payload gets a UUID. Reads drop duplicate ids,
//!   and [`PayloadStore::acknowledge`] removes entries by id.
//!
//! - **Atomic rewrite**: acknowledged entries are removed by writing the
//!   remaining lines to a temporary file and renaming it over the store.
//!
//! - **Serialized access**: all file operations hold an async mutex for their
//!   whole duration, plus an `flock` on a `.lock` sidecar shared with every
//!   other process using the same store.
//!
//! # Example
//!
//! ```no_run
//! use keystats_monitor::store::{PayloadStore, StoreError};
//! # use keystats_monitor::types::KeystrokePayload;
//!
//! # async fn example(payload: KeystrokePayload) -> Result<(), StoreError> {
//! let store = PayloadStore::open("/tmp/keystats/pending.jsonl").await?;
//! let id = store.append(payload).await?;
//!
//! let pending = store.pending().await?;
//! assert_eq!(pending[0].id, id);
//!
//! store.acknowledge(&[id]).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::KeystrokePayload;

/// Errors that can occur while reading or writing the store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A payload awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPayload {
    /// Identity assigned when the payload was stored.
    pub id: Uuid,
    /// When the payload was stored (UTC epoch seconds).
    pub stored_at: i64,
    pub payload: KeystrokePayload,
}

/// JSONL file of payloads awaiting delivery.
#[derive(Debug)]
pub struct PayloadStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

/// Cross-process lock on the store, released when dropped.
#[derive(Debug)]
struct StoreLock {
    _file: File,
}

/// Lock mode for [`PayloadStore::lock_file`].
#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Fsyncs the directory containing `path` so a completed rename survives power
/// loss.
pub(crate) async fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::File::open(parent).await?.sync_all().await?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

impl PayloadStore {
    /// Opens the store at `path`, creating its parent directory.
    ///
    /// Entries written by earlier processes remain pending.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the parent directory cannot be created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let lock_path = path.with_extension("jsonl.lock");
        Ok(Self {
            path,
            lock_path,
            lock: Mutex::new(()),
        })
    }

    /// Location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a payload and syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the payload cannot be serialized or durably
    /// written. The payload must then be considered not stored.
    pub async fn append(&self, payload: KeystrokePayload) -> Result<Uuid, StoreError> {
        let record = StoredPayload {
            id: Uuid::new_v4(),
            stored_at: Utc::now().timestamp(),
            payload,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let _flock = self.lock_file(LockMode::Exclusive).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;

        debug!(id = %record.id, path = %self.path.display(), "Stored payload");
        Ok(record.id)
    }

    /// Returns all pending payloads in the order they were stored.
    ///
    /// Corrupt lines are skipped and later occurrences of an id are dropped.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file exists but cannot be read.
    pub async fn pending(&self) -> Result<Vec<StoredPayload>, StoreError> {
        let _guard = self.lock.lock().await;
        let _flock = self.lock_file(LockMode::Shared).await?;
        self.read_records().await
    }

    /// Number of pending payloads.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file exists but cannot be read.
    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.pending().await?.len())
    }

    /// Returns `true` if nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file exists but cannot be read.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Removes acknowledged payloads, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be rewritten. On failure the
    /// previous file is left in place and the payloads stay pending.
    pub async fn acknowledge(&self, ids: &[Uuid]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked: HashSet<&Uuid> = ids.iter().collect();

        let _guard = self.lock.lock().await;
        let _flock = self.lock_file(LockMode::Exclusive).await?;

        let records = self.read_records().await?;
        let before = records.len();

        let remaining: Vec<&StoredPayload> =
            records.iter().filter(|r| !acked.contains(&r.id)).collect();

        let mut body = String::new();
        for record in &remaining {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        sync_parent_dir(&self.path).await?;

        let removed = before - remaining.len();
        debug!(removed, remaining = remaining.len(), "Acknowledged payloads");
        Ok(removed)
    }

    /// Takes the `flock` on the sidecar lock file, waiting for other processes.
    async fn lock_file(&self, mode: LockMode) -> Result<StoreLock, StoreError> {
        let lock_path = self.lock_path.clone();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)?;
            match mode {
                LockMode::Shared => FileExt::lock_shared(&file)?,
                LockMode::Exclusive => FileExt::lock_exclusive(&file)?,
            }
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(StoreLock { _file: file })
    }

    async fn read_records(&self) -> Result<Vec<StoredPayload>, StoreError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredPayload>(line) {
                Ok(record) => {
                    if seen.insert(record.id) {
                        records.push(record);
                    } else {
                        debug!(id = %record.id, "Skipping duplicate stored payload");
                    }
                }
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Skipping corrupt stored payload");
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystrokes::KeystrokeStats;
    use crate::types::{ChangeKind, EnvironmentTags, Project};
    use tempfile::TempDir;

    fn payload(keystrokes: i64) -> KeystrokePayload {
        let mut stats = KeystrokeStats::new(
            Some(Project::new("/src/app", "app")),
            EnvironmentTags::current(2),
        );
        stats
            .file_mut("a.rs", 100, 100)
            .apply(ChangeKind::Add, keystrokes);
        stats.has_data();
        stats.to_payload()
    }

    async fn open(dir: &TempDir) -> PayloadStore {
        PayloadStore::open(dir.path().join("data").join("pending.jsonl"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        assert!(store.is_empty().await.unwrap());
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_pending_preserves_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let first = store.append(payload(1)).await.unwrap();
        let second = store.append(payload(2)).await.unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[0].payload.keystrokes, 1);
        assert_eq!(pending[1].id, second);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = open(&dir).await.append(payload(3)).await.unwrap();

        let reopened = open(&dir).await;
        let pending = reopened.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_only_given_ids() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let a = store.append(payload(1)).await.unwrap();
        let b = store.append(payload(2)).await.unwrap();
        let c = store.append(payload(3)).await.unwrap();

        assert_eq!(store.acknowledge(&[a, c]).await.unwrap(), 2);

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.append(payload(1)).await.unwrap();

        assert_eq!(store.acknowledge(&[Uuid::new_v4()]).await.unwrap(), 0);
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.acknowledge(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acknowledged_payload_is_not_pending_after_restart() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let id = store.append(payload(1)).await.unwrap();
        store.acknowledge(&[id]).await.unwrap();
        drop(store);

        assert!(open(&dir).await.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_read_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.append(payload(1)).await.unwrap();

        let contents = std::fs::read_to_string(store.path()).unwrap();
        std::fs::write(store.path(), format!("{contents}{contents}")).unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.append(payload(1)).await.unwrap();

        let mut contents = std::fs::read_to_string(store.path()).unwrap();
        contents.push_str("{\"truncated\": \n");
        std::fs::write(store.path(), contents).unwrap();
        store.append(payload(2)).await.unwrap();

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].payload.keystrokes, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_handles_do_not_lose_appends_during_acknowledge() {
        let dir = TempDir::new().unwrap();
        let writer = std::sync::Arc::new(open(&dir).await);
        let drainer = std::sync::Arc::new(open(&dir).await);

        let appending = {
            let writer = writer.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for n in 0..100 {
                    ids.push(writer.append(payload(n)).await.unwrap());
                }
                ids
            })
        };
        let acknowledging = {
            let drainer = drainer.clone();
            tokio::spawn(async move {
                let mut acked = Vec::new();
                for _ in 0..100 {
                    let pending = drainer.pending().await.unwrap();
                    if let Some(first) = pending.first() {
                        drainer.acknowledge(&[first.id]).await.unwrap();
                        acked.push(first.id);
                    }
                    tokio::task::yield_now().await;
                }
                acked
            })
        };

        let appended = appending.await.unwrap();
        let acked: HashSet<Uuid> = acknowledging.await.unwrap().into_iter().collect();
        let pending: HashSet<Uuid> = writer
            .pending()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();

        for id in &appended {
            assert!(
                acked.contains(id) ^ pending.contains(id),
                "payload {id} was lost or both acknowledged and pending"
            );
        }
        assert_eq!(acked.len() + pending.len(), appended.len());
    }

    #[tokio::test]
    async fn test_acknowledge_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let id = store.append(payload(1)).await.unwrap();
        store.acknowledge(&[id]).await.unwrap();

        assert!(!store.path().with_extension("jsonl.tmp").exists());
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_sync_parent_dir_accepts_store_path() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.append(payload(1)).await.unwrap();

        sync_parent_dir(store.path()).await.unwrap();
        sync_parent_dir(Path::new("pending.jsonl")).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_stored() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open(&dir).await);

        let handles: Vec<_> = (1..=8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move { store.append(payload(n)).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len().await.unwrap(), 8);
    }
}
