//! The per-model outstanding-work marker (spec §4.7 "Tag").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `{value, expiry}`, stored on a model document (spec §3 "Representation
/// choices"). `value` counts how many of the model's operations currently
/// have an outstanding async `ProcessJob` in flight; `expiry` bounds how
/// long an orphaned tag - one whose owning job crashed or was lost - can
/// keep a model pinned to the scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Outstanding operation count. Never negative in a well-behaved store.
    pub value: i64,
    /// When an orphaned tag stops pinning the model to the scan.
    pub expiry: DateTime<Utc>,
}

impl Tag {
    /// A tag with no outstanding work, expiring immediately.
    pub fn none(now: DateTime<Utc>) -> Self {
        Self { value: 0, expiry: now }
    }

    /// Does this model have work the scan should keep surfacing?
    pub fn is_outstanding(&self) -> bool {
        self.value > 0
    }

    /// Has the tag's expiry passed `now`?
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}
