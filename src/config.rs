//! Layered configuration, resolved the same way the upstream CLI bootstrapping in this codebase
//! always has: defaults, then environment variables, then an optional config file, then CLI
//! arguments, each layer overriding the one before it.

use crate::policy::MaxFileAgePolicy;
use anyhow::Context;
use config::{Config as ConfigRs, Environment, File, Map, Source, Value};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};

pub const DEFAULT_OUTPUT_FILE_EXTENSION: &str = ".log";
const DEFAULT_PARTITION_OUTPUT_DT_FORMAT: &str = "dt=%Y-%m-%d";
const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_FILE_AGE_SECONDS: u64 = 3600;
const DEFAULT_MAX_FILE_RECORDS: u64 = 1_000_000;
const DEFAULT_OFFSETS_PER_PARTITION: u64 = 10_000;
const DEFAULT_GENERATION: u32 = 0;
const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;
const DEFAULT_UPLOAD_RETRY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_UPLOAD_RETRY_BASE_DELAY_MS: u64 = 200;
const DEFAULT_FILE_READER_DELIMITER: &str = "\n";
const DEFAULT_MESSAGE_PARSER: &str = "timestamped";

/// Which concrete [`crate::message::MessageParser`] to build, plus the fields each variant needs.
/// Unused fields for a given `kind` are ignored, matching the way the upstream per-topic writer
/// config only reads the keys relevant to the chosen format.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageParserConfig {
    pub kind: String,
    pub timestamp_field: Option<String>,
    pub timestamp_field_fallback: Option<String>,
    pub timestamp_unit: Option<String>,
    pub input_format: Option<String>,
    pub prefix_identifier_field: Option<String>,
    pub prefix_mapping: Option<HashMap<String, String>>,
}

impl Default for MessageParserConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_MESSAGE_PARSER.to_string(),
            timestamp_field: None,
            timestamp_field_fallback: None,
            timestamp_unit: None,
            input_format: None,
            prefix_identifier_field: None,
            prefix_mapping: None,
        }
    }
}

/// Configuration values that drive the behavior of the commit pipeline.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub local_path: String,
    pub remote_path: String,
    pub kafka_group: String,
    pub bootstrap_servers: String,
    pub topic: String,
    pub consumer_properties: Option<HashMap<String, String>>,

    pub message_parser: MessageParserConfig,
    pub output_file_pattern: Option<String>,
    pub partition_output_dt_format: String,
    pub partition_prefix: String,
    pub message_channel_identifier: Option<String>,

    pub max_file_age_policy: String,
    pub max_file_size_bytes: u64,
    pub max_file_age_seconds: u64,
    pub max_file_records: u64,
    pub offsets_per_partition: u64,

    pub file_reader_delimiter: String,
    pub file_writer_delimiter: Option<String>,
    pub compress: bool,

    pub generation: u32,
    pub upload_concurrency: usize,
    pub upload_retry_max_attempts: u32,
    pub upload_retry_base_delay_ms: u64,

    pub log_level: String,
}

impl Config {
    /// Resolves configuration with precedence (lowest to highest): built-in defaults,
    /// `SECORITE_`-prefixed environment variables, an optional config file, then `cli_args`.
    pub fn new<S>(config_file: Option<&Path>, cli_args: S) -> anyhow::Result<Self>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = ConfigRs::builder()
            .add_source(Defaults)
            .add_source(Environment::with_prefix("SECORITE").separator("_"));

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(cli_args)
            .build()
            .context("assemble configuration sources")?;

        config.try_deserialize().context("deserialize configuration")
    }

    pub fn max_file_age_policy(&self) -> anyhow::Result<MaxFileAgePolicy> {
        match self.max_file_age_policy.as_str() {
            "oldest" => Ok(MaxFileAgePolicy::Oldest),
            "newest" => Ok(MaxFileAgePolicy::Newest),
            other => Err(anyhow::anyhow!("unknown max_file_age_policy {other}")),
        }
    }

    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_seconds)
    }

    pub fn file_reader_delimiter_byte(&self) -> anyhow::Result<u8> {
        single_byte(&self.file_reader_delimiter, "file_reader_delimiter")
    }

    pub fn file_writer_delimiter_byte(&self) -> anyhow::Result<Option<u8>> {
        self.file_writer_delimiter
            .as_deref()
            .map(|d| single_byte(d, "file_writer_delimiter"))
            .transpose()
    }
}

fn single_byte(s: &str, field: &str) -> anyhow::Result<u8> {
    let mut bytes = s.bytes();
    let first = bytes.next().ok_or_else(|| anyhow::anyhow!("{field} must not be empty"))?;
    if bytes.next().is_some() {
        return Err(anyhow::anyhow!("{field} must be exactly one byte"));
    }
    Ok(first)
}

/// Implements [`Source`] for the crate's built-in defaults, the lowest-precedence layer.
#[derive(Debug)]
struct Defaults;

impl Source for Defaults {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(Defaults)
    }

    fn collect(&self) -> Result<Map<String, Value>, config::ConfigError> {
        let mut cfg = Map::new();

        cfg.insert("localPath".to_string(), Value::from("/tmp/secorite"));
        cfg.insert("remotePath".to_string(), Value::from(""));
        cfg.insert("kafkaGroup".to_string(), Value::from("secorite"));
        cfg.insert("bootstrapServers".to_string(), Value::from("localhost:9092"));
        cfg.insert(
            "partitionOutputDtFormat".to_string(),
            Value::from(DEFAULT_PARTITION_OUTPUT_DT_FORMAT),
        );
        cfg.insert("partitionPrefix".to_string(), Value::from("dt="));
        cfg.insert("maxFileAgePolicy".to_string(), Value::from("oldest"));
        cfg.insert("maxFileSizeBytes".to_string(), Value::from(DEFAULT_MAX_FILE_SIZE_BYTES as i64));
        cfg.insert("maxFileAgeSeconds".to_string(), Value::from(DEFAULT_MAX_FILE_AGE_SECONDS as i64));
        cfg.insert("maxFileRecords".to_string(), Value::from(DEFAULT_MAX_FILE_RECORDS as i64));
        cfg.insert("offsetsPerPartition".to_string(), Value::from(DEFAULT_OFFSETS_PER_PARTITION as i64));
        cfg.insert("fileReaderDelimiter".to_string(), Value::from(DEFAULT_FILE_READER_DELIMITER));
        cfg.insert("fileWriterDelimiter".to_string(), Value::from(DEFAULT_FILE_READER_DELIMITER));
        cfg.insert("compress".to_string(), Value::from(false));
        cfg.insert("generation".to_string(), Value::from(DEFAULT_GENERATION as i64));
        cfg.insert("uploadConcurrency".to_string(), Value::from(DEFAULT_UPLOAD_CONCURRENCY as i64));
        cfg.insert(
            "uploadRetryMaxAttempts".to_string(),
            Value::from(DEFAULT_UPLOAD_RETRY_MAX_ATTEMPTS as i64),
        );
        cfg.insert(
            "uploadRetryBaseDelayMs".to_string(),
            Value::from(DEFAULT_UPLOAD_RETRY_BASE_DELAY_MS as i64),
        );
        cfg.insert("logLevel".to_string(), Value::from("info"));

        let mut message_parser = Map::new();
        message_parser.insert("kind".to_string(), Value::from(DEFAULT_MESSAGE_PARSER));
        cfg.insert("messageParser".to_string(), Value::from(message_parser));

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Map as CfgMap, Value as CfgValue};

    #[derive(Debug, Clone)]
    struct EmptyCli;

    impl Source for EmptyCli {
        fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
            Box::new(EmptyCli)
        }
        fn collect(&self) -> Result<CfgMap<String, CfgValue>, config::ConfigError> {
            Ok(CfgMap::new())
        }
    }

    #[test]
    fn defaults_resolve_without_a_config_file() {
        let config = Config::new(None, EmptyCli).unwrap();
        assert_eq!(config.kafka_group, "secorite");
        assert_eq!(config.max_file_size_bytes, DEFAULT_MAX_FILE_SIZE_BYTES);
        assert_eq!(config.message_parser.kind, "timestamped");
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("SECORITE_KAFKA_GROUP", "from-env");
        let config = Config::new(None, EmptyCli).unwrap();
        std::env::remove_var("SECORITE_KAFKA_GROUP");
        assert_eq!(config.kafka_group, "from-env");
    }
}
