//! Per-task in-memory index of available jobs (spec §4.3).
//!
//! Populated by the reconcile stream, guarded by a [`dashmap::DashMap`]
//! rather than a hand-rolled `Mutex<HashMap<..>>`: the board's stream-
//! consumer task and its workers' poll loops mutate the map concurrently
//! without wanting to hold a lock across an await point.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::store::{JobId, JobRecord, JobState};

/// Default randomized per-process dequeue lag ceiling.
pub const DEFAULT_MAX_LAG: Duration = Duration::from_millis(100);
/// Default block period: how long a returned entry is hidden from this
/// board before it's eligible again, absent a fresher update from the stream.
pub const DEFAULT_BLOCK_PERIOD: Duration = Duration::from_secs(10);

/// A per-task in-memory mirror of potentially-available job records.
pub struct Board {
    entries: DashMap<JobId, JobRecord>,
    max_lag: Duration,
    block_period: Duration,
}

impl Board {
    /// Create a board with explicit lag/block settings. `max_lag = 0`
    /// disables randomized lag entirely (spec §9 open question: "apply
    /// only when `MaxLag > 0`").
    pub fn new(max_lag: Duration, block_period: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_lag,
            block_period,
        }
    }

    /// Number of records currently mirrored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the board is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a record observed via the reconcile stream: entries whose
    /// state is in `{Enqueued, Dequeued, Failed}` are (re-)inserted with a
    /// fresh randomized lag on `available`; terminal entries are removed.
    pub fn apply(&self, record: JobRecord) {
        if JobState::DEQUEUE_ELIGIBLE.contains(&record.state) {
            self.insert_with_lag(record);
        } else {
            self.entries.remove(&record.id);
        }
    }

    fn insert_with_lag(&self, mut record: JobRecord) {
        if !self.max_lag.is_zero() {
            let lag_ms = fastrand::u64(0..self.max_lag.as_millis().max(1) as u64);
            record.available += ChronoDuration::milliseconds(lag_ms as i64);
        }
        self.entries.insert(record.id, record);
    }

    /// Return the first entry whose in-memory `available` has passed, and
    /// advance that entry's `available` by `block_period` before returning
    /// it - this prevents the same board from handing the record to another
    /// worker on this process until either the DB state update propagates
    /// back through the stream, or the block period elapses (guarding
    /// against a crashed worker livelocking the board).
    pub fn poll(&self) -> Option<JobRecord> {
        let now = Utc::now();
        for mut entry in self.entries.iter_mut() {
            if entry.available < now {
                let snapshot = entry.clone();
                entry.available = now + ChronoDuration::from_std(self.block_period)
                    .unwrap_or(ChronoDuration::zero());
                return Some(snapshot);
            }
        }
        None
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LAG, DEFAULT_BLOCK_PERIOD)
    }
}
