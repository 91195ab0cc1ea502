//! In-memory index of open writers for one (topic, Kafka partition). The registry is
//! partitioned by Kafka partition — one instance per [`crate::consumer_loop::ConsumerLoop`] — so
//! loops never contend on each other's entries, matching the concurrency model in the design.
//!
//! Entries are looked up by the logical-partition combo alone (`partitions`), not by the full
//! [`LogFilePath`]: the path's first offset is only known once the entry is opened, so it can't
//! be part of the lookup key.

use crate::{
    codec::{FileCodec, FileCodecWriter, KeyValue},
    error::{Result, SecoriteError},
    path::LogFilePath,
};
use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Instant, SystemTime},
};

/// One open (or sealed) file. Exclusively owned by the [`FileRegistry`]; callers only ever
/// borrow it for the duration of a single append.
pub struct RegistryEntry {
    pub path: LogFilePath,
    pub local_path: PathBuf,
    writer: Option<Box<dyn FileCodecWriter>>,
    pub bytes_written: u64,
    pub record_count: u64,
    pub created_at: SystemTime,
    pub last_write_at: SystemTime,
    pub first_offset: u64,
    pub last_offset: u64,
    created_instant: Instant,
    sealed: bool,
}

impl RegistryEntry {
    /// Age of this entry since it was created.
    pub fn age(&self) -> std::time::Duration {
        self.created_instant.elapsed()
    }
}

/// Tracks open writers keyed by logical-partition combo for one (topic, Kafka partition).
pub struct FileRegistry {
    codec: Box<dyn FileCodec>,
    local_root: PathBuf,
    entries: HashMap<Vec<String>, RegistryEntry>,
}

impl FileRegistry {
    pub fn new(codec: Box<dyn FileCodec>, local_root: PathBuf) -> Self {
        Self {
            codec,
            local_root,
            entries: HashMap::new(),
        }
    }

    /// Returns the existing entry for `partitions`, or opens a new writer via `make_path`
    /// (invoked only the first time this combo is seen) and records `first_offset` for it.
    pub fn get_or_open(
        &mut self,
        partitions: &[String],
        first_offset: u64,
        make_path: impl FnOnce() -> Result<LogFilePath>,
    ) -> Result<&mut RegistryEntry> {
        let key = partitions.to_vec();

        if !self.entries.contains_key(&key) {
            let path = make_path()?;
            let local_path = self.local_root.join(path.render().trim_start_matches('/'));
            if let Some(parent) = local_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SecoriteError::TransientIo {
                    operation: "create local staging directory",
                    source: e.into(),
                })?;
            }

            let writer = self.codec.open_writer(&local_path)?;
            let now = SystemTime::now();

            let entry = RegistryEntry {
                path,
                local_path,
                writer: Some(writer),
                bytes_written: 0,
                record_count: 0,
                created_at: now,
                last_write_at: now,
                first_offset,
                last_offset: first_offset,
                created_instant: Instant::now(),
                sealed: false,
            };

            self.entries.insert(key.clone(), entry);
        }

        Ok(self.entries.get_mut(&key).expect("just inserted"))
    }

    /// Appends a record to the entry for `partitions`, updating its bookkeeping from the
    /// codec's own byte counter (not the payload length — compression matters for the
    /// size-based commit policy).
    pub fn append(&mut self, partitions: &[String], kv: KeyValue) -> Result<()> {
        let entry = self
            .entries
            .get_mut(partitions)
            .ok_or_else(|| SecoriteError::InvariantViolation(format!("no open entry for {partitions:?}")))?;

        if entry.sealed {
            return Err(SecoriteError::InvariantViolation(
                "attempted to append to a sealed entry".to_string(),
            ));
        }

        let offset = kv.offset;
        entry
            .writer
            .as_mut()
            .expect("entry has a writer while unsealed")
            .write(&kv)?;

        entry.bytes_written = entry
            .writer
            .as_ref()
            .expect("entry has a writer while unsealed")
            .length();
        entry.record_count += 1;
        entry.last_write_at = SystemTime::now();
        entry.last_offset = offset;

        Ok(())
    }

    /// Flushes and closes the codec for `partitions`. The entry becomes sealed: no further
    /// appends are accepted.
    pub fn close(&mut self, partitions: &[String]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(partitions)
            .ok_or_else(|| SecoriteError::InvariantViolation(format!("no open entry for {partitions:?}")))?;

        if let Some(writer) = entry.writer.take() {
            writer.close()?;
        }
        entry.sealed = true;
        Ok(())
    }

    /// Removes the entry and deletes its local file. Only safe to call once the entry's upload
    /// has succeeded and the offset store commit has been recorded.
    pub fn drop_entry(&mut self, partitions: &[String]) -> Result<()> {
        if let Some(entry) = self.entries.remove(partitions) {
            if entry.local_path.exists() {
                std::fs::remove_file(&entry.local_path).map_err(|e| SecoriteError::TransientIo {
                    operation: "delete local file",
                    source: e.into(),
                })?;
            }
        }
        Ok(())
    }

    /// Keys of every currently open entry.
    pub fn open_keys(&self) -> Vec<Vec<String>> {
        self.entries.keys().cloned().collect()
    }

    pub fn entry(&self, partitions: &[String]) -> Option<&RegistryEntry> {
        self.entries.get(partitions)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Maximum `last_offset` across every open entry. The union of offset ranges across all
    /// entries for a (topic, kafkaPartition) covers a contiguous prefix of consumed offsets
    /// (including skipped-by-parser messages, which are not written but are still covered by
    /// some entry's `last_offset`), so this is the candidate new `committed` value.
    pub fn max_last_offset(&self) -> Option<u64> {
        self.entries.values().map(|e| e.last_offset).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Compression, DelimitedCodec};

    fn codec() -> Box<dyn FileCodec> {
        Box::new(DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::None,
        })
    }

    fn make_path(offset: u64) -> LogFilePath {
        LogFilePath::new(
            "t",
            "topic",
            vec!["dt=2024-01-02".to_string()],
            0,
            vec![3],
            vec![offset],
            ".log",
            Vec::new(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn append_tracks_bytes_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = FileRegistry::new(codec(), dir.path().to_path_buf());

        let partitions = vec!["dt=2024-01-02".to_string()];
        registry.get_or_open(&partitions, 100, || Ok(make_path(100))).unwrap();
        registry.append(&partitions, KeyValue { offset: 100, value: b"a".to_vec() }).unwrap();
        registry.append(&partitions, KeyValue { offset: 101, value: b"b".to_vec() }).unwrap();

        let entry = registry.entry(&partitions).unwrap();
        assert_eq!(entry.record_count, 2);
        assert_eq!(entry.last_offset, 101);
        assert_eq!(entry.first_offset, 100);
        assert!(entry.bytes_written > 0);
        assert_eq!(registry.max_last_offset(), Some(101));
    }

    #[test]
    fn second_open_reuses_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = FileRegistry::new(codec(), dir.path().to_path_buf());
        let partitions = vec!["dt=2024-01-02".to_string()];

        registry.get_or_open(&partitions, 100, || Ok(make_path(100))).unwrap();
        registry.get_or_open(&partitions, 999, || Ok(make_path(999))).unwrap();

        // The second call must not re-open with a different first_offset.
        assert_eq!(registry.entry(&partitions).unwrap().first_offset, 100);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sealed_entry_rejects_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = FileRegistry::new(codec(), dir.path().to_path_buf());
        let partitions = vec!["dt=2024-01-02".to_string()];

        registry.get_or_open(&partitions, 5, || Ok(make_path(5))).unwrap();
        registry.close(&partitions).unwrap();

        let result = registry.append(&partitions, KeyValue { offset: 5, value: b"x".to_vec() });
        assert!(result.is_err());
    }

    #[test]
    fn drop_removes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = FileRegistry::new(codec(), dir.path().to_path_buf());
        let partitions = vec!["dt=2024-01-02".to_string()];

        registry.get_or_open(&partitions, 1, || Ok(make_path(1))).unwrap();
        let local_path = registry.entry(&partitions).unwrap().local_path.clone();
        registry.close(&partitions).unwrap();
        assert!(local_path.exists());

        registry.drop_entry(&partitions).unwrap();
        assert!(!local_path.exists());
        assert!(registry.is_empty());
    }
}
