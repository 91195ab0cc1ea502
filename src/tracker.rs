//! Per-Kafka-partition working set. Thin aggregation layer over a [`FileRegistry`]: the
//! registry owns the entries, the tracker answers the questions the [`crate::policy::CommitPolicy`]
//! needs about them without each caller re-deriving the same scan.

use crate::registry::FileRegistry;
use std::time::{Duration, SystemTime};

/// Aggregate view of one (topic, Kafka partition)'s open entries.
pub struct PartitionSnapshot {
    pub entry_count: usize,
    pub max_bytes_written: u64,
    pub max_record_count: u64,
    pub oldest_entry_age: Option<Duration>,
    pub newest_entry_age: Option<Duration>,
}

/// Computes the aggregates a [`crate::policy::CommitPolicy`] needs from the registry, without
/// the registry itself needing to know about policy thresholds.
pub struct PartitionTracker;

impl PartitionTracker {
    pub fn snapshot(registry: &FileRegistry) -> PartitionSnapshot {
        let mut max_bytes_written = 0;
        let mut max_record_count = 0;
        let mut oldest_entry_age = None;
        let mut newest_entry_age = None;

        for entry in registry.entries() {
            max_bytes_written = max_bytes_written.max(entry.bytes_written);
            max_record_count = max_record_count.max(entry.record_count);

            let age = entry.age();
            oldest_entry_age = Some(oldest_entry_age.map_or(age, |o: Duration| o.max(age)));
            newest_entry_age = Some(newest_entry_age.map_or(age, |n: Duration| n.min(age)));
        }

        PartitionSnapshot {
            entry_count: registry.len(),
            max_bytes_written,
            max_record_count,
            oldest_entry_age,
            newest_entry_age,
        }
    }

    /// Wall-clock time since the earliest entry was created; used by the `oldest` max-age
    /// policy. `None` when the registry has nothing open.
    pub fn oldest_created_at(registry: &FileRegistry) -> Option<SystemTime> {
        registry.entries().map(|e| e.created_at).min()
    }
}
