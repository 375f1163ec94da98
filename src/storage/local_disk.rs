//! Local disk shard state store
//!
//! Persists the slot state of each shard as one JSON file. Pushes merge
//! into the file with the coalescing rule under a lock held by the store,
//! so concurrent pushes through one store converge on the same state.
//!
//! The lock is per process. Processes taking turns on a directory (a
//! restart, a shard handed over) see each other's state, but two processes
//! pushing the same shard at once may lose one of the writes.
//!
//! # Directory Structure
//!
//! ```text
//! base_path/
//!   shard_{id}.json      - persisted stamps of one shard
//!   shard_{id}.json.tmp  - in-flight write, renamed into place
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::traits::ShardStateStore;
use crate::error::StorageError;
use crate::rollup::Granularity;
use crate::state::{coalesce, merge_persisted, ShardStateMap, SlotState, UpdateStamp};
use crate::types::ShardId;

const FORMAT_VERSION: u32 = 1;

/// One persisted stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedSlot {
    granularity: Granularity,
    slot: usize,
    timestamp: i64,
    state: SlotState,
}

/// On-disk layout of one shard file
#[derive(Debug, Serialize, Deserialize)]
struct ShardStateFile {
    version: u32,
    shard: ShardId,
    /// Wall-clock time of the last write, informational
    updated_at: i64,
    slots: Vec<PersistedSlot>,
}

impl ShardStateFile {
    fn from_map(shard: ShardId, state: &ShardStateMap) -> Self {
        let slots = state
            .iter()
            .flat_map(|(granularity, slots)| {
                slots.iter().map(move |(slot, stamp)| PersistedSlot {
                    granularity: *granularity,
                    slot: *slot,
                    timestamp: stamp.timestamp(),
                    state: stamp.state(),
                })
            })
            .collect();
        Self {
            version: FORMAT_VERSION,
            shard,
            updated_at: chrono::Utc::now().timestamp_millis(),
            slots,
        }
    }

    fn into_map(self) -> ShardStateMap {
        let mut map = ShardStateMap::new();
        for persisted in self.slots {
            let stamp = UpdateStamp::new(persisted.timestamp, persisted.state).clean();
            let slots = map.entry(persisted.granularity).or_default();
            if let Some(kept) = coalesce(slots.get(&persisted.slot), stamp) {
                slots.insert(persisted.slot, kept);
            }
        }
        map
    }
}

/// Shard state store backed by a local directory
#[derive(Debug)]
pub struct LocalDiskStateStore {
    base_path: PathBuf,
    /// Serializes read-merge-write cycles within this process
    write_lock: Mutex<()>,
}

impl LocalDiskStateStore {
    /// Open a store rooted at `base_path`, creating the directory if needed
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn shard_path(&self, shard: ShardId) -> PathBuf {
        self.base_path.join(format!("shard_{}.json", shard))
    }

    async fn read_file(&self, shard: ShardId) -> Result<ShardStateMap, StorageError> {
        let path = self.shard_path(shard);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ShardStateMap::new()),
            Err(e) => return Err(e.into()),
        };

        let file: ShardStateFile = serde_json::from_slice(&bytes)?;
        if file.version != FORMAT_VERSION || file.shard != shard {
            return Err(StorageError::CorruptedData(format!(
                "{}: version {} shard {}",
                path.display(),
                file.version,
                file.shard
            )));
        }
        Ok(file.into_map())
    }
}

#[async_trait]
impl ShardStateStore for LocalDiskStateStore {
    async fn persist_shard_state(&self, shard: ShardId, state: &ShardStateMap) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut merged = match self.read_file(shard).await {
            Ok(existing) => existing,
            Err(StorageError::CorruptedData(detail)) => {
                warn!(shard, detail = %detail, "Replacing unreadable shard state file");
                ShardStateMap::new()
            },
            Err(e) => return Err(e),
        };

        let mut changed = 0usize;
        for (granularity, slots) in state {
            let persisted = merged.entry(*granularity).or_default();
            for (slot, stamp) in slots {
                if let Some(kept) = merge_persisted(persisted.get(slot), stamp.clean()) {
                    persisted.insert(*slot, kept);
                    changed += 1;
                }
            }
        }

        let bytes = serde_json::to_vec_pretty(&ShardStateFile::from_map(shard, &merged))?;
        let path = self.shard_path(shard);
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        debug!(shard, changed, path = %path.display(), "Persisted shard state");
        Ok(())
    }

    async fn load_shard_state(&self, shard: ShardId) -> Result<ShardStateMap, StorageError> {
        self.read_file(shard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(entries: &[(Granularity, usize, UpdateStamp)]) -> ShardStateMap {
        let mut map = ShardStateMap::new();
        for (g, slot, stamp) in entries {
            map.entry(*g).or_default().insert(*slot, *stamp);
        }
        map
    }

    #[tokio::test]
    async fn test_missing_shard_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskStateStore::new(dir.path()).unwrap();
        assert!(store.load_shard_state(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskStateStore::new(dir.path()).unwrap();
        let pushed = state(&[
            (Granularity::Min5, 10, UpdateStamp::active(1_000)),
            (Granularity::Min1440, 2, UpdateStamp::rolled(900)),
        ]);

        store.persist_shard_state(3, &pushed).await.unwrap();
        assert!(dir.path().join("shard_3.json").exists());
        assert!(!dir.path().join("shard_3.json.tmp").exists());

        let loaded = store.load_shard_state(3).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let stamp = loaded[&Granularity::Min5][&10];
        assert!(stamp.same_as(&UpdateStamp::active(1_000)));
        assert!(!stamp.is_dirty());
    }

    #[tokio::test]
    async fn test_pushes_merge_by_coalescing() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskStateStore::new(dir.path()).unwrap();

        store
            .persist_shard_state(0, &state(&[(Granularity::Min20, 1, UpdateStamp::rolled(500))]))
            .await
            .unwrap();
        // an older push from a slower process does not win
        store
            .persist_shard_state(0, &state(&[(Granularity::Min20, 1, UpdateStamp::active(400))]))
            .await
            .unwrap();
        // an active stamp at the same time does
        store
            .persist_shard_state(
                0,
                &state(&[
                    (Granularity::Min20, 1, UpdateStamp::active(500)),
                    (Granularity::Min20, 2, UpdateStamp::active(600)),
                ]),
            )
            .await
            .unwrap();

        let loaded = store.load_shard_state(0).await.unwrap();
        assert!(loaded[&Granularity::Min20][&1].same_as(&UpdateStamp::active(500)));
        assert_eq!(loaded[&Granularity::Min20].len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_pushes_through_one_store_converge() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LocalDiskStateStore::new(dir.path()).unwrap());

        let pushes: Vec<_> = (0..16usize)
            .map(|slot| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    let stamp = UpdateStamp::active(1_000 + slot as i64);
                    store
                        .persist_shard_state(2, &state(&[(Granularity::Min60, slot, stamp)]))
                        .await
                })
            })
            .collect();
        for push in pushes {
            push.await.unwrap().unwrap();
        }

        let loaded = store.load_shard_state(2).await.unwrap();
        assert_eq!(loaded[&Granularity::Min60].len(), 16);
        assert!(loaded[&Granularity::Min60][&15].same_as(&UpdateStamp::active(1_015)));
    }

    #[tokio::test]
    async fn test_corrupted_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = LocalDiskStateStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("shard_1.json"), b"{not json").unwrap();

        let err = store.load_shard_state(1).await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptedData(_)));
        assert!(!err.is_transient());

        // a push replaces the unreadable file
        store
            .persist_shard_state(1, &state(&[(Granularity::Min5, 0, UpdateStamp::active(1))]))
            .await
            .unwrap();
        assert_eq!(store.load_shard_state(1).await.unwrap().len(), 1);
    }
}
