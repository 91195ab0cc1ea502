//! Finalizes and uploads a registry's open entries, then advances the offset store. This is the
//! linearization point of the commit pipeline: `committed` only moves forward once every upload
//! in the batch has succeeded.

use crate::{
    blob_store::BlobStore,
    error::{Result, SecoriteError},
    offset_store::{OffsetKey, OffsetStore},
    registry::FileRegistry,
};
use futures::{stream, StreamExt};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

pub struct Uploader {
    pub blob_store: std::sync::Arc<dyn BlobStore>,
    pub offset_store: std::sync::Arc<dyn OffsetStore>,
    pub upload_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Uploader {
    /// Runs the full upload protocol for every currently open entry in `registry`:
    ///
    /// 1. Close every entry (no further appends are accepted for them; the caller holds `&mut
    ///    FileRegistry` for the duration, which is this partition's write lock).
    /// 2. Compute the new committed candidate as `max(last_offset) + 1`.
    /// 3. Upload every finalized file, with bounded concurrency and retried backoff.
    /// 4. Only once every upload has succeeded, write `committed` to the offset store.
    /// 5. Delete local files and drop the entries from the registry.
    ///
    /// Returns the new committed offset. If any upload exhausts its retries, no entries are
    /// dropped and the offset store is left untouched — the caller should treat this as a
    /// partition-fatal error per the design's failure semantics.
    pub async fn flush_partition(
        &self,
        registry: &mut FileRegistry,
        group: &str,
        topic: &str,
        kafka_partition: i32,
    ) -> Result<Option<u64>> {
        let keys = registry.open_keys();
        if keys.is_empty() {
            return Ok(None);
        }

        for key in &keys {
            registry.close(key)?;
        }

        let candidate = registry
            .max_last_offset()
            .map(|max| max + 1)
            .expect("registry was non-empty before close");

        let uploads = stream::iter(keys.iter().cloned().map(|partitions| {
            let entry = registry.entry(&partitions).expect("entry still present after close");
            let local_path = entry.local_path.clone();
            let remote_uri = entry.path.render();
            async move {
                self.upload_with_retry(&local_path, &remote_uri).await.map(|_| partitions)
            }
        }))
        .buffer_unordered(self.upload_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        for result in &uploads {
            if let Err(e) = result {
                tracing::error!(
                    topic, kafka_partition, error = %e,
                    "upload failed after retries; offsets not advanced for this partition"
                );
                return Err(SecoriteError::TransientIo {
                    operation: "upload registry entries",
                    source: anyhow::anyhow!("{e}"),
                });
            }
        }

        let offset_key = OffsetKey {
            group: group.to_string(),
            topic: topic.to_string(),
            kafka_partition,
        };

        self.commit_with_retry(&offset_key, candidate).await?;

        for key in &keys {
            registry.drop_entry(key)?;
        }

        tracing::info!(topic, kafka_partition, committed = candidate, "advanced committed offset");

        Ok(Some(candidate))
    }

    async fn upload_with_retry(&self, local_path: &std::path::Path, remote_uri: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.blob_store.upload(local_path, remote_uri).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(remote_uri, attempt, error = %e, "upload attempt failed, retrying");
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// The offset store write after a successful upload is itself retried with backoff: the
    /// uploaded object already exists and is idempotent to re-upload, so a retry here never
    /// risks data loss, only delay.
    async fn commit_with_retry(&self, key: &OffsetKey, committed: u64) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.offset_store.set_committed(key, committed).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        topic = %key.topic,
                        kafka_partition = key.kafka_partition,
                        attempt,
                        error = %e,
                        "offset store commit failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob_store::InMemoryBlobStore,
        codec::{Compression, DelimitedCodec, FileCodec, KeyValue},
        offset_store::InMemoryOffsetStore,
        path::LogFilePath,
    };
    use std::sync::Arc;

    fn codec() -> Box<dyn FileCodec> {
        Box::new(DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::None,
        })
    }

    #[tokio::test]
    async fn no_gap_upload_advances_committed_to_max_last_offset_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = FileRegistry::new(codec(), dir.path().to_path_buf());

        let partitions = vec!["dt=2014-05-13".to_string()];
        registry
            .get_or_open(&partitions, 100, || {
                LogFilePath::new(
                    "t",
                    "topic",
                    vec!["dt=2014-05-13".to_string()],
                    0,
                    vec![3],
                    vec![100],
                    ".log",
                    Vec::new(),
                    None,
                )
            })
            .unwrap();
        registry.append(&partitions, KeyValue { offset: 100, value: b"a".to_vec() }).unwrap();
        registry.append(&partitions, KeyValue { offset: 101, value: b"b".to_vec() }).unwrap();

        let blob_store = Arc::new(InMemoryBlobStore::new());
        let offset_store = Arc::new(InMemoryOffsetStore::new());
        let uploader = Uploader {
            blob_store: blob_store.clone(),
            offset_store: offset_store.clone(),
            upload_concurrency: 4,
            retry: RetryPolicy::default(),
        };

        let committed = uploader
            .flush_partition(&mut registry, "group", "topic", 3)
            .await
            .unwrap();

        assert_eq!(committed, Some(102));
        assert!(registry.is_empty());
        assert_eq!(blob_store.len(), 1);

        let key = OffsetKey {
            group: "group".to_string(),
            topic: "topic".to_string(),
            kafka_partition: 3,
        };
        assert_eq!(offset_store.get(&key).await.unwrap().unwrap().committed, 102);
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = FileRegistry::new(codec(), dir.path().to_path_buf());

        let uploader = Uploader {
            blob_store: Arc::new(InMemoryBlobStore::new()),
            offset_store: Arc::new(InMemoryOffsetStore::new()),
            upload_concurrency: 4,
            retry: RetryPolicy::default(),
        };

        let committed = uploader
            .flush_partition(&mut registry, "group", "topic", 3)
            .await
            .unwrap();

        assert_eq!(committed, None);
    }
}
