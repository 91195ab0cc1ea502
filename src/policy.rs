//! Decides when a Kafka partition's in-flight data must be flushed and uploaded. Evaluated by
//! the [`crate::consumer_loop::ConsumerLoop`] after every append and on a timer.

use crate::{registry::FileRegistry, tracker::PartitionTracker};
use std::time::Duration;

/// Whether file age is measured from the oldest or newest open entry. `oldest` is the common
/// case: the partition shouldn't sit on old data even if it keeps receiving fresh appends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxFileAgePolicy {
    Oldest,
    Newest,
}

#[derive(Clone, Debug)]
pub struct CommitPolicy {
    pub max_file_size_bytes: u64,
    pub max_file_age: Duration,
    pub max_file_records: u64,
    pub age_policy: MaxFileAgePolicy,
}

/// Why [`CommitPolicy::should_flush`] tripped, for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    MaxSize,
    MaxAge,
    MaxRecords,
    Explicit,
}

impl CommitPolicy {
    /// Evaluates every size/age/count trigger against the registry's current entries. Does not
    /// evaluate the explicit-flush trigger (shutdown, rebalance revocation) — callers invoke
    /// [`FlushReason::Explicit`] directly for that, since it isn't derived from entry state.
    pub fn should_flush(&self, registry: &FileRegistry) -> Option<FlushReason> {
        if registry.is_empty() {
            return None;
        }

        let snapshot = PartitionTracker::snapshot(registry);

        if snapshot.max_bytes_written >= self.max_file_size_bytes {
            return Some(FlushReason::MaxSize);
        }

        if snapshot.max_record_count >= self.max_file_records {
            return Some(FlushReason::MaxRecords);
        }

        let age = match self.age_policy {
            MaxFileAgePolicy::Oldest => snapshot.oldest_entry_age,
            MaxFileAgePolicy::Newest => snapshot.newest_entry_age,
        };

        if let Some(age) = age {
            if age >= self.max_file_age {
                return Some(FlushReason::MaxAge);
            }
        }

        None
    }
}
