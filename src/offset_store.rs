//! Durable map of `(group, topic, kafkaPartition) -> {committed, lastSeen}`. Production
//! deployments typically back this with ZooKeeper or an equivalent coordination store; only the
//! trait contract is specified here, with an in-memory fake for tests and a JSON-file-backed
//! implementation as a dependency-free durable default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::error::{Result, SecoriteError};

/// Key identifying one partition's offset state.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct OffsetKey {
    pub group: String,
    pub topic: String,
    pub kafka_partition: i32,
}

/// The two monotonic counters tracked per [`OffsetKey`]. `committed` only ever advances inside
/// the uploader's success path; `lastSeen` is updated by the consumer loop for lag metrics.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct OffsetState {
    pub committed: u64,
    pub last_seen: u64,
}

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn get(&self, key: &OffsetKey) -> Result<Option<OffsetState>>;
    async fn set_committed(&self, key: &OffsetKey, committed: u64) -> Result<()>;
    async fn set_last_seen(&self, key: &OffsetKey, last_seen: u64) -> Result<()>;
}

fn transient(operation: &'static str, err: impl std::error::Error + Send + Sync + 'static) -> SecoriteError {
    SecoriteError::TransientIo {
        operation,
        source: err.into(),
    }
}

/// In-memory [`OffsetStore`], used in tests and as the seed for the file-backed implementation.
#[derive(Default, Clone)]
pub struct InMemoryOffsetStore {
    state: Arc<Mutex<HashMap<OffsetKey, OffsetState>>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn get(&self, key: &OffsetKey) -> Result<Option<OffsetState>> {
        Ok(self.state.lock().expect("lock acquired").get(key).copied())
    }

    async fn set_committed(&self, key: &OffsetKey, committed: u64) -> Result<()> {
        let mut guard = self.state.lock().expect("lock acquired");
        let entry = guard.entry(key.clone()).or_default();
        debug_assert!(
            committed >= entry.committed,
            "committed offset must never decrease"
        );
        entry.committed = committed;
        entry.last_seen = entry.last_seen.max(committed);
        Ok(())
    }

    async fn set_last_seen(&self, key: &OffsetKey, last_seen: u64) -> Result<()> {
        let mut guard = self.state.lock().expect("lock acquired");
        let entry = guard.entry(key.clone()).or_default();
        entry.last_seen = entry.last_seen.max(last_seen);
        Ok(())
    }
}

/// Persists the same map as [`InMemoryOffsetStore`] to a single JSON file, rewritten atomically
/// (write-to-temp, then rename) on every mutation. Stands in for a ZooKeeper-backed store
/// without adding a coordination-service dependency to the crate.
pub struct FileOffsetStore {
    path: PathBuf,
    inner: InMemoryOffsetStore,
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(OffsetKey, OffsetState)>,
}

impl FileOffsetStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = InMemoryOffsetStore::new();

        if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| transient("read offset store file", e))?;
            let snapshot: Snapshot = serde_json::from_str(&contents)
                .map_err(|e| SecoriteError::Config(anyhow::anyhow!("invalid offset store file: {e}")))?;
            let mut guard = inner.state.lock().expect("lock acquired");
            for (k, v) in snapshot.entries {
                guard.insert(k, v);
            }
        }

        Ok(Self { path, inner })
    }

    async fn persist(&self) -> Result<()> {
        let entries: Vec<(OffsetKey, OffsetState)> = self
            .inner
            .state
            .lock()
            .expect("lock acquired")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let snapshot = Snapshot { entries };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| transient("serialize offset store snapshot", e))?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| transient("write offset store temp file", e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| transient("rename offset store temp file", e))?;

        Ok(())
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn get(&self, key: &OffsetKey) -> Result<Option<OffsetState>> {
        self.inner.get(key).await
    }

    async fn set_committed(&self, key: &OffsetKey, committed: u64) -> Result<()> {
        self.inner.set_committed(key, committed).await?;
        self.persist().await
    }

    async fn set_last_seen(&self, key: &OffsetKey, last_seen: u64) -> Result<()> {
        self.inner.set_last_seen(key, last_seen).await?;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> OffsetKey {
        OffsetKey {
            group: "g".to_string(),
            topic: "t".to_string(),
            kafka_partition: 3,
        }
    }

    #[tokio::test]
    async fn offset_monotonicity_in_memory() {
        let store = InMemoryOffsetStore::new();
        store.set_committed(&key(), 102).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap().unwrap().committed, 102);

        store.set_committed(&key(), 205).await.unwrap();
        assert_eq!(store.get(&key()).await.unwrap().unwrap().committed, 205);
    }

    #[tokio::test]
    async fn file_store_round_trips_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        {
            let store = FileOffsetStore::open(&path).await.unwrap();
            store.set_committed(&key(), 42).await.unwrap();
        }

        let reopened = FileOffsetStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&key()).await.unwrap().unwrap().committed, 42);
    }
}
