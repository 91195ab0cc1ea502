use thiserror::Error;

/// The operational error taxonomy for the commit pipeline. Every fallible path in the crate
/// resolves to one of these variants so that callers can decide retry-vs-fatal without
/// inspecting error strings.
#[derive(Error, Debug)]
pub enum SecoriteError {
    /// A [`crate::message::MessageParser`] failed to extract partitions or a timestamp from a
    /// message. Non-fatal: the caller routes the message to a fallback partition and logs.
    #[error("failed to parse message from topic {topic} partition {partition} offset {offset}: {source}")]
    Parse {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },

    /// A transient failure talking to Kafka, the [`crate::blob_store::BlobStore`], or the
    /// [`crate::offset_store::OffsetStore`]. Retried with capped exponential backoff.
    #[error("transient I/O error during {operation}: {source}")]
    TransientIo {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration is missing or malformed. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),

    /// A topic requires a schema (the ORC codec path) and none was provided, or the provided
    /// schema cannot be used. Fatal for that topic only; other partitions continue.
    #[error("schema error for topic {topic}: {source}")]
    Schema {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    /// An invariant of the data model was violated (non-consecutive Kafka partitions in a
    /// [`crate::path::LogFilePath`], a path that fails to round-trip through parse/render).
    /// Fatal process-wide: this indicates a bug, not an external failure.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A local file discovered during orphan scan does not match the expected basename shape.
    /// The file is quarantined, not deleted.
    #[error("malformed path at {path}: {reason}")]
    MalformedPath { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SecoriteError>;

impl SecoriteError {
    /// Whether this error kind is safe to retry with backoff. Used by the uploader and offset
    /// commit paths; any other variant is either already-handled (Parse) or fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecoriteError::TransientIo { .. })
    }
}
