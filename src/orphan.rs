//! Startup recovery scan. A local staging file can be left behind by a crash at any point
//! between being opened and being dropped from the registry: this walks the local root, tries to
//! parse each file as a [`LogFilePath`], and either resumes it (re-upload, then advance the
//! offset store) or quarantines it if the name doesn't match the expected shape.

use crate::{
    blob_store::BlobStore,
    codec::FileCodec,
    error::Result,
    offset_store::{OffsetKey, OffsetStore},
    path::{LogFilePath, PathBuilder},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug, Default)]
pub struct OrphanScanReport {
    pub resumed: u64,
    pub quarantined: u64,
}

pub struct OrphanScanner {
    pub local_root: PathBuf,
    pub prefix: String,
    pub extension: String,
    pub group: String,
    pub codec: Box<dyn FileCodec>,
    pub blob_store: Arc<dyn BlobStore>,
    pub offset_store: Arc<dyn OffsetStore>,
}

impl OrphanScanner {
    /// Walks every regular file under `local_root` (skipping the quarantine directory itself)
    /// and resolves it per file.
    pub async fn scan(&self) -> Result<OrphanScanReport> {
        let mut report = OrphanScanReport::default();
        let files = self.list_files(&self.local_root)?;

        for file in files {
            match self.resolve_one(&file).await {
                Ok(true) => report.resumed += 1,
                Ok(false) => report.quarantined += 1,
                Err(e) => {
                    tracing::error!(path = %file.display(), error = %e, "failed to resolve orphaned file");
                }
            }
        }

        Ok(report)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let quarantine_dir = self.local_root.join(".quarantine");
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            if current == quarantine_dir {
                continue;
            }

            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }

        Ok(out)
    }

    /// Returns `Ok(true)` if the file was resumed (uploaded and offsets advanced), `Ok(false)` if
    /// it was quarantined for a human to inspect.
    async fn resolve_one(&self, local_path: &Path) -> Result<bool> {
        let relative = local_path
            .strip_prefix(&self.local_root)
            .unwrap_or(local_path)
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");

        let parsed = match PathBuilder::parse(&self.prefix, &relative, &self.extension) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %relative, reason = %e, "quarantining unparseable orphan file");
                self.quarantine(local_path)?;
                return Ok(false);
            }
        };

        let last_offset = self.last_offset_in_file(local_path, &parsed)?;
        self.blob_store.upload(local_path, &parsed.render()).await?;

        let key = OffsetKey {
            group: self.group.clone(),
            topic: parsed.topic.clone(),
            kafka_partition: parsed.kafka_partitions[0],
        };

        let candidate = last_offset + 1;
        let current = self.offset_store.get(&key).await?.map(|s| s.committed).unwrap_or(0);
        if candidate > current {
            self.offset_store.set_committed(&key, candidate).await?;
        }

        std::fs::remove_file(local_path).ok();
        Ok(true)
    }

    fn last_offset_in_file(&self, local_path: &Path, parsed: &LogFilePath) -> Result<u64> {
        let mut reader = self.codec.open_reader(local_path, parsed.offsets[0])?;
        let mut last = parsed.offsets[0];
        while let Some(kv) = reader.next()? {
            last = kv.offset;
        }
        Ok(last)
    }

    fn quarantine(&self, local_path: &Path) -> Result<()> {
        let quarantine_dir = self.local_root.join(".quarantine");
        std::fs::create_dir_all(&quarantine_dir).map_err(|e| crate::error::SecoriteError::TransientIo {
            operation: "create quarantine directory",
            source: e.into(),
        })?;

        let file_name = local_path.file_name().unwrap_or_default();
        let dest = quarantine_dir.join(file_name);
        std::fs::rename(local_path, dest).map_err(|e| crate::error::SecoriteError::TransientIo {
            operation: "move file to quarantine",
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob_store::InMemoryBlobStore,
        codec::{Compression, DelimitedCodec, FileCodecWriter},
        offset_store::InMemoryOffsetStore,
    };

    fn codec() -> Box<dyn FileCodec> {
        Box::new(DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::None,
        })
    }

    #[tokio::test]
    async fn resumes_a_well_formed_orphan_file() {
        let dir = tempfile::tempdir().unwrap();
        let topic_dir = dir.path().join("topic").join("dt=2024-01-02");
        std::fs::create_dir_all(&topic_dir).unwrap();
        let file_path = topic_dir.join("0_3_00000000000000000100.log");

        let mut writer = codec().open_writer(&file_path).unwrap();
        writer.write(&crate::codec::KeyValue { offset: 100, value: b"a".to_vec() }).unwrap();
        writer.write(&crate::codec::KeyValue { offset: 101, value: b"b".to_vec() }).unwrap();
        writer.close().unwrap();

        let blob_store = Arc::new(InMemoryBlobStore::new());
        let offset_store = Arc::new(InMemoryOffsetStore::new());

        let scanner = OrphanScanner {
            local_root: dir.path().to_path_buf(),
            prefix: String::new(),
            extension: ".log".to_string(),
            group: "group".to_string(),
            codec: codec(),
            blob_store: blob_store.clone(),
            offset_store: offset_store.clone(),
        };

        let report = scanner.scan().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(report.quarantined, 0);
        assert_eq!(blob_store.len(), 1);
        assert!(!file_path.exists());

        let key = OffsetKey {
            group: "group".to_string(),
            topic: "topic".to_string(),
            kafka_partition: 3,
        };
        assert_eq!(offset_store.get(&key).await.unwrap().unwrap().committed, 102);
    }

    #[tokio::test]
    async fn quarantines_a_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let topic_dir = dir.path().join("topic").join("dt=2024-01-02");
        std::fs::create_dir_all(&topic_dir).unwrap();
        let file_path = topic_dir.join("not-a-valid-name.log");
        std::fs::write(&file_path, b"garbage").unwrap();

        let scanner = OrphanScanner {
            local_root: dir.path().to_path_buf(),
            prefix: String::new(),
            extension: ".log".to_string(),
            group: "group".to_string(),
            codec: codec(),
            blob_store: Arc::new(InMemoryBlobStore::new()),
            offset_store: Arc::new(InMemoryOffsetStore::new()),
        };

        let report = scanner.scan().await.unwrap();
        assert_eq!(report.resumed, 0);
        assert_eq!(report.quarantined, 1);
        assert!(!file_path.exists());
        assert!(dir.path().join(".quarantine").join("not-a-valid-name.log").exists());
    }
}
