//! Message parsing capability set. The source this design is distilled from used an abstract
//! class hierarchy for parser variants; here that's flattened into a `MessageParser` trait plus
//! a small set of concrete variants, with date-formatting and prefix-lookup shared as free
//! functions rather than inherited from a common base.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// A raw record pulled from Kafka, prior to any parsing.
#[derive(Clone, Debug)]
pub struct Message {
    pub topic: String,
    pub kafka_partition: i32,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

/// A [`Message`] plus the logical partitions extracted from it.
#[derive(Clone, Debug)]
pub struct ParsedMessage {
    pub message: Message,
    pub partitions: Vec<String>,
}

/// Capability set implemented by every message parser variant.
pub trait MessageParser: Send + Sync {
    /// Extracts the ordered logical partitions for a message, e.g. `["dt=2024-01-02"]`.
    fn extract_partitions(&self, msg: &Message) -> anyhow::Result<Vec<String>>;
    /// Extracts a timestamp, in milliseconds since the epoch, used to format the date partition.
    fn extract_timestamp_millis(&self, msg: &Message) -> anyhow::Result<i64>;
}

/// Parses a message by routing it through a [`MessageParser`], falling back to
/// `fallback_partition` and logging when parsing fails. Parse failures are a deliberate
/// availability choice: losing archival fidelity for one bucket is preferable to stalling the
/// whole partition loop.
pub fn parse_with_fallback(
    parser: &dyn MessageParser,
    message: Message,
    fallback_partition: &str,
) -> ParsedMessage {
    match parser.extract_partitions(&message) {
        Ok(partitions) => ParsedMessage { message, partitions },
        Err(e) => {
            tracing::warn!(
                topic = %message.topic,
                partition = message.kafka_partition,
                offset = message.offset,
                error = %e,
                "failed to parse message, routing to fallback partition"
            );
            ParsedMessage {
                partitions: vec![fallback_partition.to_string()],
                message,
            }
        }
    }
}

/// Units a raw timestamp field may be expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Millis,
    Nanos,
}

impl TimeUnit {
    fn to_millis(self, value: i64) -> i64 {
        match self {
            TimeUnit::Seconds => value * 1000,
            TimeUnit::Millis => value,
            TimeUnit::Nanos => value / 1_000_000,
        }
    }
}

/// Time zone used when formatting a timestamp into a partition string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionTimeZone {
    Utc,
    Local,
}

/// Formats `timestamp_millis` in `tz` using `pattern` (a `chrono` strftime pattern, e.g.
/// `"dt=%Y-%m-%d"`). Shared between [`TimestampedParser`] and [`PatternDateParser`] so the two
/// variants don't need a common base type to reuse it.
pub fn format_partition(timestamp_millis: i64, tz: PartitionTimeZone, pattern: &str) -> String {
    match tz {
        PartitionTimeZone::Utc => {
            let dt: DateTime<Utc> = Utc
                .timestamp_millis_opt(timestamp_millis)
                .single()
                .unwrap_or_else(Utc::now);
            dt.format(pattern).to_string()
        }
        PartitionTimeZone::Local => {
            let dt: DateTime<Local> = Local
                .timestamp_millis_opt(timestamp_millis)
                .single()
                .unwrap_or_else(Local::now);
            dt.format(pattern).to_string()
        }
    }
}

/// Looks up `identifier_value` in `mapping`, falling back to the `DEFAULT` entry. Shared by any
/// parser variant that prepends a prefix folder derived from a per-record identifier field.
pub fn lookup_prefix<'a>(mapping: &'a HashMap<String, String>, identifier_value: &str) -> Option<&'a str> {
    mapping
        .get(identifier_value)
        .or_else(|| mapping.get("DEFAULT"))
        .map(String::as_str)
}

/// Reads a dotted path (`"a.b.c"`) out of a JSON value. Used both by parsers reading a
/// configurable timestamp field and by the `message_channel_identifier` lookup.
pub fn json_dotted_get<'a>(value: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in dotted_path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn parse_payload_json(payload: &[u8]) -> anyhow::Result<Value> {
    serde_json::from_slice(payload).map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))
}

/// Parses a configurable timestamp field out of the JSON payload (with an optional fallback
/// field name), converts it to milliseconds per the configured unit, and formats a single date
/// partition (optionally with additional hour/minute partitions).
pub struct TimestampedParser {
    pub timestamp_field: String,
    pub timestamp_field_fallback: Option<String>,
    pub unit: TimeUnit,
    pub output_pattern: String,
    pub tz: PartitionTimeZone,
    pub hour_pattern: Option<String>,
    pub minute_pattern: Option<String>,
}

impl MessageParser for TimestampedParser {
    fn extract_timestamp_millis(&self, msg: &Message) -> anyhow::Result<i64> {
        let json = parse_payload_json(&msg.payload)?;

        let raw = json_dotted_get(&json, &self.timestamp_field)
            .or_else(|| {
                self.timestamp_field_fallback
                    .as_ref()
                    .and_then(|f| json_dotted_get(&json, f))
            })
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "neither {} nor fallback field present in payload",
                    self.timestamp_field
                )
            })?;

        let raw_i64 = raw
            .as_i64()
            .or_else(|| raw.as_str().and_then(|s| s.parse::<i64>().ok()))
            .ok_or_else(|| anyhow::anyhow!("timestamp field is not an integer"))?;

        Ok(self.unit.to_millis(raw_i64))
    }

    fn extract_partitions(&self, msg: &Message) -> anyhow::Result<Vec<String>> {
        let millis = self.extract_timestamp_millis(msg)?;
        let mut partitions = vec![format_partition(millis, self.tz, &self.output_pattern)];

        if let Some(hp) = &self.hour_pattern {
            partitions.push(format_partition(millis, self.tz, hp));
        }
        if let Some(mp) = &self.minute_pattern {
            partitions.push(format_partition(millis, self.tz, mp));
        }

        Ok(partitions)
    }
}

/// Like [`TimestampedParser`], but the input field is itself a date string parsed with
/// `input_format`, and an optional per-record prefix mapping is prepended to the partition list.
pub struct PatternDateParser {
    pub timestamp_field: String,
    pub input_format: String,
    pub output_pattern: String,
    pub tz: PartitionTimeZone,
    pub prefix_identifier_field: Option<String>,
    pub prefix_mapping: Option<HashMap<String, String>>,
}

impl PatternDateParser {
    fn parse_millis(&self, msg: &Message) -> anyhow::Result<i64> {
        let json = parse_payload_json(&msg.payload)?;
        let raw = json_dotted_get(&json, &self.timestamp_field)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("{} missing or not a string", self.timestamp_field))?;

        let naive = chrono::NaiveDateTime::parse_from_str(raw, &self.input_format)
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(raw, &self.input_format)
                    .map(|d| d.and_hms_opt(0, 0, 0).expect("valid midnight time"))
            })
            .map_err(|e| anyhow::anyhow!("failed to parse {raw} as {}: {e}", self.input_format))?;

        Ok(naive.and_utc().timestamp_millis())
    }
}

impl MessageParser for PatternDateParser {
    fn extract_timestamp_millis(&self, msg: &Message) -> anyhow::Result<i64> {
        self.parse_millis(msg)
    }

    fn extract_partitions(&self, msg: &Message) -> anyhow::Result<Vec<String>> {
        let millis = self.parse_millis(msg)?;
        let mut partitions = Vec::new();

        if let (Some(field), Some(mapping)) = (&self.prefix_identifier_field, &self.prefix_mapping) {
            let json = parse_payload_json(&msg.payload)?;
            let identifier = json_dotted_get(&json, field)
                .and_then(Value::as_str)
                .unwrap_or_default();

            if let Some(folder) = lookup_prefix(mapping, identifier) {
                partitions.push(folder.to_string());
            }
        }

        partitions.push(format_partition(millis, self.tz, &self.output_pattern));
        Ok(partitions)
    }
}

/// The timestamp is always "now"; a second partition buckets the message's own offset into
/// ranges of `offsets_per_partition`, for offset-bucketed archival independent of message
/// content.
pub struct DailyOffsetParser {
    pub output_pattern: String,
    pub tz: PartitionTimeZone,
    pub offsets_per_partition: u64,
}

impl MessageParser for DailyOffsetParser {
    fn extract_timestamp_millis(&self, _msg: &Message) -> anyhow::Result<i64> {
        Ok(Utc::now().timestamp_millis())
    }

    fn extract_partitions(&self, msg: &Message) -> anyhow::Result<Vec<String>> {
        let millis = Utc::now().timestamp_millis();
        let date_partition = format_partition(millis, self.tz, &self.output_pattern);
        let bucket = (msg.offset / self.offsets_per_partition) * self.offsets_per_partition;

        Ok(vec![date_partition, format!("offset={bucket}")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(payload: &str, offset: u64) -> Message {
        Message {
            topic: "t".to_string(),
            kafka_partition: 3,
            offset,
            payload: payload.as_bytes().to_vec(),
            timestamp: None,
        }
    }

    #[test]
    fn s1_timestamped_default_parser() {
        let parser = TimestampedParser {
            timestamp_field: "ts".to_string(),
            timestamp_field_fallback: None,
            unit: TimeUnit::Millis,
            output_pattern: "dt=%Y-%m-%d".to_string(),
            tz: PartitionTimeZone::Utc,
            hour_pattern: None,
            minute_pattern: None,
        };

        let m1 = msg(r#"{"ts": 1400000000000}"#, 100);
        let m2 = msg(r#"{"ts": 1400086400000}"#, 101);

        assert_eq!(parser.extract_partitions(&m1).unwrap(), vec!["dt=2014-05-13"]);
        assert_eq!(parser.extract_partitions(&m2).unwrap(), vec!["dt=2014-05-14"]);
    }

    #[test]
    fn s3_daily_offset_parser() {
        let parser = DailyOffsetParser {
            output_pattern: "dt=%Y-%m-%d".to_string(),
            tz: PartitionTimeZone::Utc,
            offsets_per_partition: 10_000,
        };

        let m = msg("{}", 23457);
        let partitions = parser.extract_partitions(&m).unwrap();
        assert_eq!(partitions[1], "offset=20000");
    }

    #[test]
    fn parse_failure_falls_back() {
        let parser = TimestampedParser {
            timestamp_field: "ts".to_string(),
            timestamp_field_fallback: None,
            unit: TimeUnit::Millis,
            output_pattern: "dt=%Y-%m-%d".to_string(),
            tz: PartitionTimeZone::Utc,
            hour_pattern: None,
            minute_pattern: None,
        };

        let m = msg("not json", 5);
        let parsed = parse_with_fallback(&parser, m, "dt=1970-01-01");
        assert_eq!(parsed.partitions, vec!["dt=1970-01-01".to_string()]);
    }

    #[test]
    fn prefix_lookup_falls_back_to_default() {
        let mut mapping = HashMap::new();
        mapping.insert("DEFAULT".to_string(), "misc".to_string());
        mapping.insert("orders".to_string(), "orders-folder".to_string());

        assert_eq!(lookup_prefix(&mapping, "orders"), Some("orders-folder"));
        assert_eq!(lookup_prefix(&mapping, "unknown"), Some("misc"));
    }
}
