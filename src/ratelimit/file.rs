//! File-backed counter store.
//!
//! Each identifier is persisted as its own small JSON document under the
//! store directory, named by the SHA-256 of the identifier. Records survive a
//! process restart. Writes go to a temporary file first and are renamed into
//! place, so a reader never sees a half-written record.
//!
//! Exclusion is per identifier and per process: a store directory must not be
//! shared by two running processes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::counter::WindowRecord;
use super::store::{CounterStore, RecordUpdate, StoreError, StoreResult, Transition};

const RECORD_EXTENSION: &str = "json";

/// On-disk layout of one record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    #[serde(flatten)]
    record: WindowRecord,
}

/// Counter store that keeps one file per identifier in a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    /// Per-key locks for keys with an operation in flight
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened file counter store");
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    /// The directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{:x}.{}", digest, RECORD_EXTENSION))
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the lock entry for `key` once nobody else holds or awaits it.
    ///
    /// `remove_if` runs under the map's shard lock, the same lock `lock_for`
    /// needs, so a count of one means no other task has a handle.
    fn release(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn read_stored(path: &Path) -> StoreResult<Option<StoredRecord>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn read_record(&self, key: &str, path: &Path) -> StoreResult<Option<WindowRecord>> {
        match Self::read_stored(path).await? {
            Some(stored) if stored.key == key => Ok(Some(stored.record)),
            Some(stored) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("file holds record for {}", stored.key),
            }),
            None => Ok(None),
        }
    }

    async fn write_record(&self, key: &str, path: &Path, record: WindowRecord) -> StoreResult<()> {
        let stored = StoredRecord {
            key: key.to_string(),
            record,
        };
        let bytes = serde_json::to_vec(&stored).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Re-read `key` under its lock and delete it if it is still stale.
    async fn purge_key(&self, key: &str, path: &Path, cutoff: i64) -> StoreResult<bool> {
        let lock = self.lock_for(key);
        let removed = {
            let _guard = lock.lock().await;
            match self.read_record(key, path).await {
                Ok(Some(record)) if record.window_start < cutoff => {
                    fs::remove_file(path).await?;
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable record during purge");
                    false
                }
            }
        };
        drop(lock);
        self.release(key);
        Ok(removed)
    }

    fn is_record_file(path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXTENSION)
    }
}

#[async_trait]
impl CounterStore for FileStore {
    async fn update(&self, key: &str, op: &RecordUpdate) -> StoreResult<Transition> {
        let path = self.path_for(key);
        let lock = self.lock_for(key);

        let result = {
            let _guard = lock.lock().await;
            match self.read_record(key, &path).await {
                Ok(previous) => {
                    let current = op(previous);
                    self.write_record(key, &path, current)
                        .await
                        .map(|()| Transition { previous, current })
                }
                Err(e) => Err(e),
            }
        };

        drop(lock);
        self.release(key);

        if let Ok(transition) = &result {
            trace!(key = %key, count = transition.current.count, "Persisted record");
        }
        result
    }

    async fn purge_before(&self, cutoff: i64) -> StoreResult<usize> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !Self::is_record_file(&path) {
                continue;
            }

            match Self::read_stored(&path).await {
                Ok(Some(stored)) => {
                    if stored.record.window_start < cutoff
                        && self.purge_key(&stored.key, &path, cutoff).await?
                    {
                        removed += 1;
                    }
                }
                // Deleted by a concurrent purge
                Ok(None) => {}
                Err(StoreError::Corrupt { reason, .. }) => {
                    warn!(path = %path.display(), reason = %reason, "Removing corrupt record file");
                    match fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(removed)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<WindowRecord>> {
        let path = self.path_for(key);
        self.read_record(key, &path).await
    }

    async fn len(&self) -> StoreResult<usize> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if Self::is_record_file(&entry.path()) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::counter::{advance, Quota};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("tollgate-store-{}", uuid::Uuid::new_v4()))
    }

    fn set(record: WindowRecord) -> impl Fn(Option<WindowRecord>) -> WindowRecord + Send + Sync {
        move |_| record
    }

    fn bump(previous: Option<WindowRecord>) -> WindowRecord {
        let mut record = previous.unwrap_or(WindowRecord::open(100));
        record.count += 1;
        record
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = temp_dir();

        {
            let store = FileStore::open(&dir).await.unwrap();
            store.update("ip_10.0.0.1", &bump).await.unwrap();
            store.update("ip_10.0.0.1", &bump).await.unwrap();
        }

        let reopened = FileStore::open(&dir).await.unwrap();
        let record = reopened.get("ip_10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record, WindowRecord { count: 2, window_start: 100 });
        assert_eq!(reopened.len().await.unwrap(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize_per_key() {
        let dir = temp_dir();
        let store = Arc::new(FileStore::open(&dir).await.unwrap());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.update("cred_abc", &bump).await })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        let record = store.get("cred_abc").await.unwrap().unwrap();
        assert_eq!(record.count, 20);
        assert!(store.locks.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_stale_and_corrupt_files() {
        let dir = temp_dir();
        let store = FileStore::open(&dir).await.unwrap();

        store
            .update("ip_1.1.1.1", &set(WindowRecord { count: 5, window_start: 10 }))
            .await
            .unwrap();
        store
            .update("ip_2.2.2.2", &set(WindowRecord { count: 1, window_start: 500 }))
            .await
            .unwrap();
        std::fs::write(dir.join("garbage.json"), b"{not json").unwrap();

        let removed = store.purge_before(100).await.unwrap();

        assert_eq!(removed, 2);
        assert!(store.get("ip_1.1.1.1").await.unwrap().is_none());
        assert!(store.get("ip_2.2.2.2").await.unwrap().is_some());
        assert_eq!(store.len().await.unwrap(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_update() {
        let dir = temp_dir();
        let store = FileStore::open(&dir).await.unwrap();
        std::fs::write(store.path_for("ip_3.3.3.3"), b"[]").unwrap();

        let result = store.update("ip_3.3.3.3", &bump).await;

        assert!(matches!(result, Err(StoreError::Corrupt { .. })));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_purge_never_drops_a_refreshed_record() {
        let quota = Quota::new(10, 60).unwrap();
        let now = 10_000;

        for _ in 0..20 {
            let dir = temp_dir();
            let store = Arc::new(FileStore::open(&dir).await.unwrap());
            for key in ["ip_10.0.0.1", "ip_10.0.0.2"] {
                store
                    .update(key, &set(WindowRecord { count: 7, window_start: 0 }))
                    .await
                    .unwrap();
            }

            let check = {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update("ip_10.0.0.1", &move |previous: Option<WindowRecord>| {
                            advance(previous, now, &quota).0
                        })
                        .await
                })
            };
            let purge = {
                let store = store.clone();
                tokio::spawn(async move { store.purge_before(now - 120).await })
            };

            check.await.unwrap().unwrap();
            let removed = purge.await.unwrap().unwrap();

            assert!(removed == 1 || removed == 2, "removed {}", removed);
            let record = store.get("ip_10.0.0.1").await.unwrap().unwrap();
            assert_eq!(record, WindowRecord { count: 1, window_start: now });
            assert!(store.get("ip_10.0.0.2").await.unwrap().is_none());
            assert_eq!(store.len().await.unwrap(), 1);
            assert!(store.locks.is_empty());

            std::fs::remove_dir_all(&dir).unwrap();
        }
    }
}
