//! Kafka consumer bootstrap. One [`StreamConsumer`] is shared across all assigned partitions;
//! each partition is split off into its own queue and driven by a dedicated
//! [`PartitionConsumerTask`] that owns a [`ConsumerLoop`], so a slow or failed partition never
//! blocks its siblings.

use crate::{
    consumer_loop::ConsumerLoop,
    message::Message,
    offset_store::{OffsetKey, OffsetStore},
};
use anyhow::Context;
use futures::TryStreamExt;
use rdkafka::{
    config::RDKafkaLogLevel,
    consumer::{
        stream_consumer::StreamPartitionQueue, BaseConsumer, Consumer as RDConsumer,
        ConsumerContext as RDConsumerContext, Rebalance, StreamConsumer,
    },
    error::KafkaResult,
    message::Message as RDMessage,
    ClientConfig, ClientContext, Offset, Statistics, TopicPartitionList,
};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Hooks into the consumer lifecycle purely for logging; offset bookkeeping lives in
/// [`crate::offset_store::OffsetStore`], not in librdkafka's own commit machinery (auto-commit is
/// disabled below).
struct ConsumerContext;

impl ClientContext for ConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => tracing::error!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Warning => tracing::warn!(facility = fac, "{}", log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                tracing::info!(facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Debug => tracing::debug!(facility = fac, "{}", log_message),
        }
    }

    fn stats(&self, statistics: Statistics) {
        tracing::debug!(
            replyq = statistics.replyq,
            msg_cnt = statistics.msg_cnt,
            msg_size = statistics.msg_size,
            "librdkafka statistics"
        );
    }
}

impl RDConsumerContext for ConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        tracing::debug!(?rebalance, "rebalance initiated");
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                for e in tpl.elements() {
                    tracing::info!(topic = e.topic(), partition = e.partition(), "assigned partition");
                }
            }
            Rebalance::Revoke(tpl) => {
                for e in tpl.elements() {
                    tracing::info!(topic = e.topic(), partition = e.partition(), "revoked partition");
                }
            }
            Rebalance::Error(err) => tracing::error!(error = %err, "error during rebalance"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            tracing::error!(error = %e, "error committing consumer offsets");
        }
    }
}

/// Owns the shared [`StreamConsumer`] and spawns one task per assigned partition.
pub struct Consumer {
    consumer: Arc<StreamConsumer<ConsumerContext>>,
    group: String,
    topic: String,
    offset_store: Arc<dyn OffsetStore>,
}

impl Consumer {
    pub fn new(
        bootstrap_servers: &str,
        group: String,
        topic: String,
        offset_store: Arc<dyn OffsetStore>,
        extra_config: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", bootstrap_servers);
        client_config.set("group.id", &group);
        client_config.set("enable.auto.commit", "false");
        client_config.set("auto.offset.reset", "latest");
        client_config.set("statistics.interval.ms", "30000");
        client_config.extend(extra_config);

        if tracing::enabled!(tracing::Level::DEBUG) {
            for (k, v) in client_config.config_map().iter() {
                tracing::debug!(key = k, value = v, "consumer property");
            }
        }

        let consumer: StreamConsumer<ConsumerContext> = client_config
            .set_log_level(RDKafkaLogLevel::Info)
            .create_with_context(ConsumerContext)
            .context("create Kafka consumer")?;

        Ok(Self {
            consumer: Arc::new(consumer),
            group,
            topic,
            offset_store,
        })
    }

    /// Assigns every partition of the configured topic, seeking each to its last committed
    /// offset (from the offset store, not librdkafka's own commit log) plus one, or to the
    /// broker's `latest` when no prior commit exists. Spawns one [`PartitionConsumerTask`] per
    /// partition and returns immediately. Each task subscribes to `shutdown` and drains its
    /// partition (a final flush via [`ConsumerLoop::revoke`]) when a signal arrives.
    pub async fn start(
        &self,
        loop_factory: impl Fn(i32) -> ConsumerLoop,
        shutdown: &tokio::sync::broadcast::Sender<()>,
    ) -> anyhow::Result<()> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), Duration::from_secs(10))
            .context("fetch topic metadata from broker")?;

        let partitions: Vec<i32> = metadata
            .topics()
            .first()
            .context("topic metadata present in response")?
            .partitions()
            .iter()
            .map(|p| p.id())
            .collect();

        tracing::info!(topic = %self.topic, ?partitions, "assigning partitions");

        let mut assignment = TopicPartitionList::with_capacity(partitions.len());
        for &partition in &partitions {
            let key = OffsetKey {
                group: self.group.clone(),
                topic: self.topic.clone(),
                kafka_partition: partition,
            };

            match self.offset_store.get(&key).await {
                Ok(Some(state)) if state.committed > 0 => {
                    assignment
                        .add_partition_offset(&self.topic, partition, Offset::Offset(state.committed as i64))
                        .context("seek to committed offset")?;
                }
                _ => {
                    let _ = assignment.add_partition(&self.topic, partition);
                }
            }
        }

        self.consumer.assign(&assignment).context("assign partitions")?;

        for partition in partitions {
            let partition_queue = self
                .consumer
                .split_partition_queue(&self.topic, partition)
                .expect("partition queue created for an assigned partition");

            let task = PartitionConsumerTask {
                partition_queue: Arc::new(partition_queue),
                consumer_loop: loop_factory(partition),
                shutdown: shutdown.subscribe(),
            };

            tokio::spawn(async move {
                if let Err(e) = task.run().await {
                    tracing::error!(partition, error = %e, "partition consumer task exited");
                }
            });
        }

        // The shared StreamConsumer must still be polled even though every partition's queue has
        // been split off, or librdkafka stops delivering events to the split queues.
        let background_poll = Arc::clone(&self.consumer);
        tokio::spawn(async move {
            let message = background_poll.recv().await;
            tracing::error!(?message, "shared stream consumer unexpectedly yielded a message");
        });

        Ok(())
    }
}

/// Drives one partition's [`StreamPartitionQueue`] into its [`ConsumerLoop`], with a periodic
/// timer tick so an age-based flush can fire even while the partition receives no new messages.
struct PartitionConsumerTask<Ctx: RDConsumerContext> {
    partition_queue: Arc<StreamPartitionQueue<Ctx>>,
    consumer_loop: ConsumerLoop,
    shutdown: tokio::sync::broadcast::Receiver<()>,
}

impl<Ctx: RDConsumerContext> PartitionConsumerTask<Ctx> {
    async fn run(mut self) -> anyhow::Result<()> {
        self.consumer_loop.start();

        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        let mut stream = self.partition_queue.stream();

        loop {
            tokio::select! {
                next = stream.try_next() => {
                    match next.context("receive message from partition queue")? {
                        Some(borrowed) => {
                            let message = Message {
                                topic: borrowed.topic().to_string(),
                                kafka_partition: borrowed.partition(),
                                offset: borrowed.offset() as u64,
                                payload: borrowed.payload().unwrap_or_default().to_vec(),
                                timestamp: borrowed.timestamp().to_millis(),
                            };
                            drop(borrowed);

                            if let Err(e) = self.consumer_loop.handle_message(message).await {
                                tracing::error!(error = %e, "partition loop entered a failed state");
                                return Err(e.into());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.consumer_loop.check_policy().await {
                        tracing::error!(error = %e, "partition loop entered a failed state during a timer check");
                        return Err(e.into());
                    }
                }
                _ = self.shutdown.recv() => {
                    tracing::info!("draining partition before shutdown");
                    self.consumer_loop.revoke().await?;
                    return Ok(());
                }
            }
        }
    }
}
