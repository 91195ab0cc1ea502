//! Per (topic, Kafka partition) state machine: routes incoming messages into the partition's
//! [`FileRegistry`], asks the [`CommitPolicy`] after every write whether to flush, and drives the
//! explicit revoke/shutdown drain path. One instance is owned by each partition task spawned in
//! [`crate::kafka`].

use crate::{
    error::Result,
    message::{parse_with_fallback, MessageParser},
    offset_store::{OffsetKey, OffsetStore},
    path::LogFilePath,
    policy::{CommitPolicy, FlushReason},
    registry::FileRegistry,
    uploader::Uploader,
};
use std::sync::Arc;

/// `IDLE --start--> CONSUMING --policyTrip--> FLUSHING --ok--> CONSUMING`, with
/// `FLUSHING --fatal--> FAILED` and `any --revoke--> FLUSHING --ok--> IDLE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Consuming,
    Flushing,
    Failed,
}

pub struct ConsumerLoop {
    pub group: String,
    pub topic: String,
    pub kafka_partition: i32,
    pub prefix: String,
    pub generation: u32,
    pub extension: String,
    pub message_channel_identifier: Vec<String>,
    pub pattern: Option<String>,
    pub fallback_partition: String,
    parser: Arc<dyn MessageParser>,
    registry: FileRegistry,
    policy: CommitPolicy,
    uploader: Arc<Uploader>,
    offset_store: Arc<dyn OffsetStore>,
    state: LoopState,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: String,
        topic: String,
        kafka_partition: i32,
        prefix: String,
        generation: u32,
        extension: String,
        message_channel_identifier: Vec<String>,
        pattern: Option<String>,
        fallback_partition: String,
        parser: Arc<dyn MessageParser>,
        registry: FileRegistry,
        policy: CommitPolicy,
        uploader: Arc<Uploader>,
        offset_store: Arc<dyn OffsetStore>,
    ) -> Self {
        Self {
            group,
            topic,
            kafka_partition,
            prefix,
            generation,
            extension,
            message_channel_identifier,
            pattern,
            fallback_partition,
            parser,
            registry,
            policy,
            uploader,
            offset_store,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// `IDLE --start--> CONSUMING`. Idempotent: calling this again once already consuming is a
    /// no-op, since partition assignment callbacks can fire more than once.
    pub fn start(&mut self) {
        if self.state != LoopState::Failed {
            self.state = LoopState::Consuming;
        }
    }

    /// Routes one raw Kafka message through parsing, the registry, and the commit policy. Only
    /// valid while `CONSUMING`; a message delivered to a failed or idle loop is a bug in the
    /// caller's task lifecycle, not a transient condition, so it's reported as an invariant
    /// violation rather than silently dropped.
    pub async fn handle_message(&mut self, message: crate::message::Message) -> Result<()> {
        if self.state != LoopState::Consuming {
            return Err(crate::error::SecoriteError::InvariantViolation(format!(
                "handle_message called while loop state was {:?}",
                self.state
            )));
        }

        let offset = message.offset;
        let parsed = parse_with_fallback(self.parser.as_ref(), message, &self.fallback_partition);
        let partitions = parsed.partitions.clone();

        let prefix = self.prefix.clone();
        let topic = self.topic.clone();
        let generation = self.generation;
        let kafka_partition = self.kafka_partition;
        let extension = self.extension.clone();
        let message_channel_identifier = self.message_channel_identifier.clone();
        let pattern = self.pattern.clone();
        let partitions_for_path = partitions.clone();

        self.registry.get_or_open(&partitions, offset, move || {
            LogFilePath::new(
                prefix,
                topic,
                partitions_for_path,
                generation,
                vec![kafka_partition],
                vec![offset],
                extension,
                message_channel_identifier,
                pattern,
            )
        })?;

        self.registry.append(
            &partitions,
            crate::codec::KeyValue {
                offset,
                value: parsed.message.payload,
            },
        )?;

        let key = OffsetKey {
            group: self.group.clone(),
            topic: self.topic.clone(),
            kafka_partition: self.kafka_partition,
        };
        if let Err(e) = self.offset_store.set_last_seen(&key, offset).await {
            tracing::warn!(
                topic = %self.topic,
                kafka_partition = self.kafka_partition,
                error = %e,
                "failed to record lastSeen offset"
            );
        }

        self.check_policy().await
    }

    /// Re-evaluates the commit policy against the registry's current state without requiring a
    /// new message. The age-based trigger can only fire this way when a partition goes quiet: a
    /// size or record-count trigger is always re-checked on the next append regardless, but a
    /// partition that stops receiving messages would otherwise never age out. Callers drive this
    /// from a timer alongside the per-message path.
    pub async fn check_policy(&mut self) -> Result<()> {
        if self.state != LoopState::Consuming {
            return Ok(());
        }

        if let Some(reason) = self.policy.should_flush(&self.registry) {
            self.flush(reason).await?;
        }

        Ok(())
    }

    /// `CONSUMING --policyTrip--> FLUSHING --ok--> CONSUMING` / `--fatal--> FAILED`.
    async fn flush(&mut self, reason: FlushReason) -> Result<()> {
        self.state = LoopState::Flushing;
        tracing::debug!(
            topic = %self.topic,
            kafka_partition = self.kafka_partition,
            ?reason,
            "flushing partition"
        );

        match self
            .uploader
            .flush_partition(&mut self.registry, &self.group, &self.topic, self.kafka_partition)
            .await
        {
            Ok(_) => {
                self.state = LoopState::Consuming;
                Ok(())
            }
            Err(e) => {
                self.state = LoopState::Failed;
                Err(e)
            }
        }
    }

    /// `any --revoke--> FLUSHING --ok--> IDLE`. Called from a rebalance revoke callback or
    /// graceful shutdown; drains whatever is open before giving up ownership of the partition.
    pub async fn revoke(&mut self) -> Result<()> {
        self.flush(FlushReason::Explicit).await?;
        self.state = LoopState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob_store::InMemoryBlobStore,
        codec::{Compression, DelimitedCodec},
        message::{Message, TimestampedParser, TimeUnit, PartitionTimeZone},
        offset_store::InMemoryOffsetStore,
        uploader::RetryPolicy,
    };
    use std::time::Duration;

    fn loop_with_policy(policy: CommitPolicy) -> (tempfile::TempDir, ConsumerLoop, Arc<InMemoryBlobStore>, Arc<InMemoryOffsetStore>) {
        let dir = tempfile::tempdir().unwrap();
        let codec: Box<dyn crate::codec::FileCodec> = Box::new(DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::None,
        });
        let registry = FileRegistry::new(codec, dir.path().to_path_buf());

        let blob_store = Arc::new(InMemoryBlobStore::new());
        let offset_store = Arc::new(InMemoryOffsetStore::new());
        let uploader = Arc::new(Uploader {
            blob_store: blob_store.clone(),
            offset_store: offset_store.clone(),
            upload_concurrency: 4,
            retry: RetryPolicy::default(),
        });

        let parser: Arc<dyn MessageParser> = Arc::new(TimestampedParser {
            timestamp_field: "ts".to_string(),
            timestamp_field_fallback: None,
            unit: TimeUnit::Millis,
            output_pattern: "dt=%Y-%m-%d".to_string(),
            tz: PartitionTimeZone::Utc,
            hour_pattern: None,
            minute_pattern: None,
        });

        let consumer_loop = ConsumerLoop::new(
            "group".to_string(),
            "topic".to_string(),
            3,
            "local-root".to_string(),
            0,
            ".log".to_string(),
            Vec::new(),
            None,
            "dt=1970-01-01".to_string(),
            parser,
            registry,
            policy,
            uploader,
            offset_store.clone(),
        );

        (dir, consumer_loop, blob_store, offset_store)
    }

    fn msg(offset: u64) -> Message {
        Message {
            topic: "topic".to_string(),
            kafka_partition: 3,
            offset,
            payload: br#"{"ts": 1400000000000}"#.to_vec(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn rejects_message_before_start() {
        let (_dir, mut consumer_loop, _blob, _offsets) = loop_with_policy(CommitPolicy {
            max_file_size_bytes: 1_000_000,
            max_file_age: Duration::from_secs(3600),
            max_file_records: 1000,
            age_policy: crate::policy::MaxFileAgePolicy::Oldest,
        });

        assert!(consumer_loop.handle_message(msg(0)).await.is_err());
    }

    #[tokio::test]
    async fn policy_trip_flushes_and_returns_to_consuming() {
        let (_dir, mut consumer_loop, blob_store, offset_store) = loop_with_policy(CommitPolicy {
            max_file_size_bytes: 1_000_000,
            max_file_age: Duration::from_secs(3600),
            max_file_records: 1,
            age_policy: crate::policy::MaxFileAgePolicy::Oldest,
        });

        consumer_loop.start();
        consumer_loop.handle_message(msg(100)).await.unwrap();

        assert_eq!(consumer_loop.state(), LoopState::Consuming);
        assert_eq!(blob_store.len(), 1);

        let key = OffsetKey {
            group: "group".to_string(),
            topic: "topic".to_string(),
            kafka_partition: 3,
        };
        assert_eq!(offset_store.get(&key).await.unwrap().unwrap().committed, 101);
    }

    #[tokio::test]
    async fn revoke_drains_open_entries_and_returns_to_idle() {
        let (_dir, mut consumer_loop, blob_store, _offsets) = loop_with_policy(CommitPolicy {
            max_file_size_bytes: 1_000_000,
            max_file_age: Duration::from_secs(3600),
            max_file_records: 1000,
            age_policy: crate::policy::MaxFileAgePolicy::Oldest,
        });

        consumer_loop.start();
        consumer_loop.handle_message(msg(0)).await.unwrap();
        assert_eq!(blob_store.len(), 0);

        consumer_loop.revoke().await.unwrap();
        assert_eq!(consumer_loop.state(), LoopState::Idle);
        assert_eq!(blob_store.len(), 1);
    }
}
