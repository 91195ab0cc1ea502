mod blob_store;
mod codec;
mod config;
mod consumer_loop;
mod error;
mod kafka;
mod message;
mod offset_store;
mod orphan;
mod path;
mod policy;
mod registry;
mod tracker;
mod uploader;

use crate::{
    blob_store::{BlobStore, ObjectStoreBlobStore},
    codec::{Compression, DelimitedCodec, FileCodec},
    config::{Config, DEFAULT_OUTPUT_FILE_EXTENSION},
    consumer_loop::ConsumerLoop,
    message::{
        DailyOffsetParser, MessageParser, PartitionTimeZone, PatternDateParser, TimeUnit,
        TimestampedParser,
    },
    offset_store::{FileOffsetStore, OffsetStore},
    orphan::OrphanScanner,
    policy::CommitPolicy,
    registry::FileRegistry,
    uploader::{RetryPolicy, Uploader},
};

use anyhow::Context;
use clap::Parser;
use ::config::{ConfigError, Map, Source, Value};
use std::{path::PathBuf, sync::Arc};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// A Kafka-to-object-store log shipper that archives topic records into partition-aligned files.
#[derive(Clone, Debug, Default, Parser)]
#[command()]
struct Cli {
    /// Local staging directory for files that are open or awaiting upload.
    #[arg(long)]
    local_path: Option<String>,
    /// Root URI of the remote object store files are uploaded to.
    #[arg(long)]
    remote_path: Option<String>,
    /// Kafka consumer group id. Shared across all processes cooperating on the same topic.
    #[arg(short, long)]
    kafka_group: Option<String>,
    /// Host value for the Kafka brokers to connect to.
    #[arg(short, long)]
    bootstrap_servers: Option<String>,
    /// Name of the Kafka topic to consume and archive.
    #[arg(short, long)]
    topic: Option<String>,
    /// Path to an optional TOML or JSON configuration file, layered beneath CLI arguments.
    #[arg(long)]
    config_file: Option<PathBuf>,
    /// Generation number, bumped across non-compatible output format releases.
    #[arg(long)]
    generation: Option<u32>,
}

impl Source for Cli {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut cfg = Map::new();

        if let Some(v) = self.local_path.as_ref() {
            cfg.insert("localPath".to_string(), Value::from(v.clone()));
        }
        if let Some(v) = self.remote_path.as_ref() {
            cfg.insert("remotePath".to_string(), Value::from(v.clone()));
        }
        if let Some(v) = self.kafka_group.as_ref() {
            cfg.insert("kafkaGroup".to_string(), Value::from(v.clone()));
        }
        if let Some(v) = self.bootstrap_servers.as_ref() {
            cfg.insert("bootstrapServers".to_string(), Value::from(v.clone()));
        }
        if let Some(v) = self.topic.as_ref() {
            cfg.insert("topic".to_string(), Value::from(v.clone()));
        }
        if let Some(v) = self.generation.as_ref() {
            cfg.insert("generation".to_string(), Value::from(*v as i64));
        }

        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config_file.clone();
    let config = Config::new(config_file.as_deref(), cli).context("load configuration")?;

    init_tracing(&config.log_level);

    run(config).await
}

/// Builds the `EnvFilter` from the `SECORITE_LOG` environment variable, falling back to
/// `log_level` from [`Config`] (itself defaulted to `info`) when the variable isn't set, and
/// writes structured log lines to stderr.
fn init_tracing(log_level: &str) {
    let default_directive: tracing_subscriber::filter::Directive =
        log_level.parse().unwrap_or_else(|_| LevelFilter::INFO.into());

    let filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var("SECORITE_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn build_parser(config: &Config) -> anyhow::Result<Arc<dyn MessageParser>> {
    let mp = &config.message_parser;
    let tz = PartitionTimeZone::Utc;

    let parser: Arc<dyn MessageParser> = match mp.kind.as_str() {
        "timestamped" => Arc::new(TimestampedParser {
            timestamp_field: mp
                .timestamp_field
                .clone()
                .ok_or_else(|| anyhow::anyhow!("messageParser.timestampField required for kind=timestamped"))?,
            timestamp_field_fallback: mp.timestamp_field_fallback.clone(),
            unit: match mp.timestamp_unit.as_deref() {
                Some("seconds") => TimeUnit::Seconds,
                Some("nanos") => TimeUnit::Nanos,
                _ => TimeUnit::Millis,
            },
            output_pattern: config.partition_output_dt_format.clone(),
            tz,
            hour_pattern: None,
            minute_pattern: None,
        }),
        "pattern_date" => Arc::new(PatternDateParser {
            timestamp_field: mp
                .timestamp_field
                .clone()
                .ok_or_else(|| anyhow::anyhow!("messageParser.timestampField required for kind=pattern_date"))?,
            input_format: mp
                .input_format
                .clone()
                .ok_or_else(|| anyhow::anyhow!("messageParser.inputFormat required for kind=pattern_date"))?,
            output_pattern: config.partition_output_dt_format.clone(),
            tz,
            prefix_identifier_field: mp.prefix_identifier_field.clone(),
            prefix_mapping: mp.prefix_mapping.clone(),
        }),
        "daily_offset" => Arc::new(DailyOffsetParser {
            output_pattern: config.partition_output_dt_format.clone(),
            tz,
            offsets_per_partition: config.offsets_per_partition,
        }),
        other => anyhow::bail!("unknown messageParser.kind {other}"),
    };

    Ok(parser)
}

fn build_codec(config: &Config) -> anyhow::Result<Box<dyn FileCodec>> {
    Ok(Box::new(DelimitedCodec {
        reader_delimiter: config.file_reader_delimiter_byte()?,
        writer_delimiter: config.file_writer_delimiter_byte()?,
        compression: if config.compress { Compression::Gzip } else { Compression::None },
    }))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let local_root = PathBuf::from(&config.local_path);
    std::fs::create_dir_all(&local_root).context("create local staging root")?;

    let blob_store: Arc<dyn BlobStore> =
        Arc::new(ObjectStoreBlobStore::local(&PathBuf::from(&config.remote_path)).context("open blob store")?);
    let offset_store: Arc<dyn OffsetStore> = Arc::new(
        FileOffsetStore::open(local_root.join(".offsets.json"))
            .await
            .context("open offset store")?,
    );

    let orphan_scanner = OrphanScanner {
        local_root: local_root.clone(),
        prefix: config.remote_path.clone(),
        extension: DEFAULT_OUTPUT_FILE_EXTENSION.to_string(),
        group: config.kafka_group.clone(),
        codec: build_codec(&config)?,
        blob_store: blob_store.clone(),
        offset_store: offset_store.clone(),
    };
    let report = orphan_scanner.scan().await.context("run orphan scan")?;
    tracing::info!(resumed = report.resumed, quarantined = report.quarantined, "orphan scan complete");

    let parser = build_parser(&config)?;
    let retry = RetryPolicy {
        max_attempts: config.upload_retry_max_attempts,
        base_delay: std::time::Duration::from_millis(config.upload_retry_base_delay_ms),
    };
    let uploader = Arc::new(Uploader {
        blob_store: blob_store.clone(),
        offset_store: offset_store.clone(),
        upload_concurrency: config.upload_concurrency,
        retry,
    });
    let commit_policy = CommitPolicy {
        max_file_size_bytes: config.max_file_size_bytes,
        max_file_age: config.max_file_age(),
        max_file_records: config.max_file_records,
        age_policy: config.max_file_age_policy()?,
    };

    let consumer = kafka::Consumer::new(
        &config.bootstrap_servers,
        config.kafka_group.clone(),
        config.topic.clone(),
        offset_store.clone(),
        config.consumer_properties.clone().unwrap_or_default(),
    )
    .context("create Kafka consumer")?;

    let fallback_partition = format!("{}1970-01-01", config.partition_prefix);
    let message_channel_identifier = config
        .message_channel_identifier
        .clone()
        .map(|v| vec![v])
        .unwrap_or_default();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let config_ref = &config;
    let loop_factory = {
        let parser = parser.clone();
        let uploader = uploader.clone();
        let offset_store = offset_store.clone();
        let local_root = local_root.clone();
        let commit_policy = commit_policy.clone();
        let fallback_partition = fallback_partition.clone();
        let message_channel_identifier = message_channel_identifier.clone();

        move |kafka_partition: i32| {
            let codec = build_codec(config_ref).expect("codec config validated at startup");
            let registry = FileRegistry::new(codec, local_root.clone());

            ConsumerLoop::new(
                config_ref.kafka_group.clone(),
                config_ref.topic.clone(),
                kafka_partition,
                config_ref.remote_path.clone(),
                config_ref.generation,
                DEFAULT_OUTPUT_FILE_EXTENSION.to_string(),
                message_channel_identifier.clone(),
                config_ref.output_file_pattern.clone(),
                fallback_partition.clone(),
                parser.clone(),
                registry,
                commit_policy.clone(),
                uploader.clone(),
                offset_store.clone(),
            )
        }
    };

    consumer.start(loop_factory, &shutdown_tx).await.context("start Kafka consumer")?;

    tokio::signal::ctrl_c().await.context("listen for shutdown signal")?;
    tracing::info!("shutdown signal received, draining partitions");
    let _ = shutdown_tx.send(());

    // give partition tasks a window to flush and upload before the process exits.
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    Ok(())
}
